//! Drives one app-install session through the GUI adapter.

use std::{thread, time::Duration};

use tracing::{debug, error, info, warn};

use crate::{
    apps::InstallBatch,
    config::Timing,
    error::InstallError,
    recovery::{RecoveryRule, RecoverySession},
    tools::{AdapterStatus, InstallAdapter},
};

pub struct Installer<'a> {
    adapter: &'a dyn InstallAdapter,
    rules: &'a [RecoveryRule],
    poll: Duration,
    stall: Duration,
}

impl std::fmt::Debug for Installer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("rules", &self.rules.len())
            .field("poll", &self.poll)
            .field("stall", &self.stall)
            .finish()
    }
}

impl<'a> Installer<'a> {
    pub fn new(
        adapter: &'a dyn InstallAdapter,
        rules: &'a [RecoveryRule],
        timing: &Timing,
    ) -> Self {
        Self {
            adapter,
            rules,
            poll: timing.install_poll,
            stall: timing.install_stall,
        }
    }

    /// Install `batch.apps` on every device of the batch and wait until the
    /// adapter is idle again.
    ///
    /// Alerts are answered through the recovery rules; an alert no rule
    /// answers (or one that repeats) ends the session with
    /// [`InstallError::Unrecoverable`].
    pub fn install(&self, batch: &InstallBatch) -> Result<(), InstallError> {
        if batch.apps.is_empty() || batch.udids.is_empty() {
            return Err(InstallError::NothingToInstall);
        }
        let mut session = RecoverySession::new(self.rules);

        // Anything left over from an earlier session has to clear first.
        self.wait(&mut session)?;

        info!(devices = batch.udids.len(), apps = ?batch.apps, "installing apps");
        self.adapter.install_apps(&batch.udids, &batch.apps)?;
        self.wait(&mut session)?;
        info!(devices = batch.udids.len(), "install finished");
        Ok(())
    }

    fn wait(&self, session: &mut RecoverySession<'_>) -> Result<(), InstallError> {
        let mut last: Option<(String, String)> = None;
        let mut repeats: u32 = 0;
        loop {
            let status = self.adapter.status()?;
            if let Some(alert) = status.alerts.first() {
                warn!(alert = %alert, "install raised an alert");
                let response = session.decide(alert)?;
                self.adapter.action(&response.choice, &response.options)?;
                last = None;
                repeats = 0;
                thread::sleep(self.poll);
                continue;
            }
            if !status.busy {
                return Ok(());
            }

            let current = activity_key(&status);
            if last.as_ref() == Some(&current) {
                repeats += 1;
            } else {
                debug!(activity = %current.0, details = %current.1, "install progress");
                last = Some(current);
                repeats = 0;
            }
            if self.poll.saturating_mul(repeats) > self.stall {
                return Err(self.abandon(&status));
            }
            thread::sleep(self.poll);
        }
    }

    /// Cancel a stalled session and relaunch the GUI.
    fn abandon(&self, status: &AdapterStatus) -> InstallError {
        let activity = if status.activity.details.is_empty() {
            status.activity.message.clone()
        } else {
            format!("{}: {}", status.activity.message, status.activity.details)
        };
        error!(activity = %activity, stall = ?self.stall, "install stalled");
        if let Err(err) = self.adapter.action("Cancel", &[]) {
            warn!(error = %err, "failed to cancel stalled install");
        }
        if let Err(err) = self.adapter.relaunch() {
            warn!(error = %err, "failed to relaunch adapter");
        }
        InstallError::Stalled { activity }
    }
}

fn activity_key(status: &AdapterStatus) -> (String, String) {
    (
        status.activity.message.clone(),
        status.activity.details.clone(),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, VecDeque};

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        error::ToolError,
        tools::{Activity, Alert},
    };

    #[derive(Default)]
    struct Scripted {
        statuses: Mutex<VecDeque<AdapterStatus>>,
        actions: Mutex<Vec<String>>,
        installs: Mutex<usize>,
        relaunched: Mutex<bool>,
    }

    impl Scripted {
        fn new(statuses: Vec<AdapterStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                ..Self::default()
            }
        }
    }

    impl InstallAdapter for Scripted {
        fn status(&self) -> Result<AdapterStatus, ToolError> {
            let mut statuses = self.statuses.lock();
            // The last scripted status repeats forever.
            if statuses.len() > 1 {
                Ok(statuses.pop_front().unwrap_or_default())
            } else {
                Ok(statuses.front().cloned().unwrap_or_default())
            }
        }

        fn install_apps(
            &self,
            _udids: &BTreeSet<String>,
            _apps: &BTreeSet<String>,
        ) -> Result<(), ToolError> {
            *self.installs.lock() += 1;
            Ok(())
        }

        fn action(&self, choice: &str, _options: &[String]) -> Result<(), ToolError> {
            self.actions.lock().push(choice.to_owned());
            Ok(())
        }

        fn relaunch(&self) -> Result<(), ToolError> {
            *self.relaunched.lock() = true;
            Ok(())
        }
    }

    fn busy(message: &str) -> AdapterStatus {
        AdapterStatus {
            busy: true,
            activity: Activity {
                message: message.to_owned(),
                ..Activity::default()
            },
            alerts: Vec::new(),
        }
    }

    fn alerting(alert: Alert) -> AdapterStatus {
        AdapterStatus {
            busy: true,
            alerts: vec![alert],
            ..AdapterStatus::default()
        }
    }

    fn batch() -> InstallBatch {
        InstallBatch {
            ecids: BTreeSet::from(["0x1".to_owned()]),
            udids: BTreeSet::from(["udid-1".to_owned()]),
            apps: BTreeSet::from(["Keynote".to_owned()]),
        }
    }

    fn timing(stall_ms: u64) -> Timing {
        Timing {
            install_poll: Duration::from_millis(1),
            install_stall: Duration::from_millis(stall_ms),
            ..Timing::default()
        }
    }

    #[test]
    fn install_waits_until_idle() {
        let adapter = Scripted::new(vec![
            AdapterStatus::default(),
            busy("Downloading"),
            busy("Installing"),
            AdapterStatus::default(),
        ]);
        let rules = RecoveryRule::builtin();
        Installer::new(&adapter, &rules, &timing(1_000))
            .install(&batch())
            .unwrap();
        assert_eq!(*adapter.installs.lock(), 1);
        assert!(adapter.actions.lock().is_empty());
    }

    #[test]
    fn known_alert_is_answered() {
        let adapter = Scripted::new(vec![
            AdapterStatus::default(),
            alerting(Alert::new(
                "The app “Keynote” already exists on “Cart 3”.",
                "",
            )),
            AdapterStatus::default(),
        ]);
        let rules = RecoveryRule::builtin();
        Installer::new(&adapter, &rules, &timing(1_000))
            .install(&batch())
            .unwrap();
        assert_eq!(*adapter.actions.lock(), vec!["Skip App".to_owned()]);
    }

    #[test]
    fn unknown_alert_ends_session() {
        let adapter = Scripted::new(vec![
            AdapterStatus::default(),
            alerting(Alert::new("Something odd happened.", "")),
        ]);
        let rules = RecoveryRule::builtin();
        let err = Installer::new(&adapter, &rules, &timing(1_000))
            .install(&batch())
            .unwrap_err();
        assert!(matches!(err, InstallError::Unrecoverable(_)));
    }

    #[test]
    fn unchanged_activity_is_a_stall() {
        let adapter = Scripted::new(vec![AdapterStatus::default(), busy("Downloading")]);
        let rules = RecoveryRule::builtin();
        let err = Installer::new(&adapter, &rules, &timing(5))
            .install(&batch())
            .unwrap_err();
        assert!(matches!(err, InstallError::Stalled { ref activity } if activity == "Downloading"));
        assert_eq!(*adapter.actions.lock(), vec!["Cancel".to_owned()]);
        assert!(*adapter.relaunched.lock());
    }

    #[test]
    fn empty_batch_is_rejected() {
        let adapter = Scripted::default();
        let rules = RecoveryRule::builtin();
        let mut empty = batch();
        empty.apps.clear();
        let err = Installer::new(&adapter, &rules, &timing(5))
            .install(&empty)
            .unwrap_err();
        assert!(matches!(err, InstallError::NothingToInstall));
    }
}
