//! Install the profile's maintenance jobs into the host's shared crontab.

use tracing::{info, instrument, warn};

use crate::core::job_table::{BlockMarkers, CronJob, JobTableError, patch_table};
use crate::core::profile::RemoteLayout;
use crate::io::config::ScheduleSettings;
use crate::io::remote::{ExecOutput, Remote, home_path};

pub const READ_TABLE: &str = "crontab -l";
pub const WRITE_TABLE: &str = "crontab -";

const REMEDIATION: &str = "allow the remote user to use cron (/etc/cron.allow or /etc/cron.deny) \
                           and re-run the deploy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Installed,
    /// Jobs not installed; the rest of the deploy still proceeds.
    Warning(String),
}

/// The two backup jobs for a profile.
pub fn maintenance_jobs(layout: &RemoteLayout, schedule: &ScheduleSettings) -> Vec<CronJob> {
    let job = |schedule: &str, kind: &str| CronJob {
        schedule: schedule.to_string(),
        command: format!(
            "cd {root} && /bin/bash scripts/backup_{kind}.sh {profile} >> {log} 2>&1",
            root = home_path(&layout.install_root),
            profile = layout.profile,
            log = home_path(&layout.backup_log(kind)),
        ),
    };
    vec![
        job(&schedule.code_backup, "code"),
        job(&schedule.data_backup, "data"),
    ]
}

/// Replace this profile's block in the crontab, leaving every other line alone.
#[instrument(skip_all, fields(destination = %remote.destination(), profile = %layout.profile))]
pub fn install_schedule<R: Remote>(
    remote: &R,
    layout: &RemoteLayout,
    schedule: &ScheduleSettings,
) -> ScheduleOutcome {
    let current = match read_table(remote) {
        Ok(table) => table,
        Err(reason) => return warning(format!("cannot read crontab: {reason}; {REMEDIATION}")),
    };

    let markers = BlockMarkers::for_profile(&layout.profile);
    let jobs = maintenance_jobs(layout, schedule);
    let updated = match patch_table(current.as_deref(), &markers, &jobs) {
        Ok(table) => table,
        Err(err @ JobTableError::Unterminated { .. }) => {
            return warning(format!(
                "crontab left unchanged: {err}; remove the stray '{}' line by hand",
                markers.begin
            ));
        }
    };

    if current.as_deref() == Some(updated.as_str()) {
        info!("crontab already up to date");
        return ScheduleOutcome::Installed;
    }

    match remote.exec_with_input(WRITE_TABLE, updated.as_bytes()) {
        Ok(out) if out.success() => {
            info!(jobs = jobs.len(), "crontab block installed");
            ScheduleOutcome::Installed
        }
        Ok(out) => warning(format!(
            "crontab write rejected: {}; {REMEDIATION}",
            describe(&out)
        )),
        Err(err) => warning(format!("crontab write failed: {err:#}; {REMEDIATION}")),
    }
}

/// `Ok(None)` when the user has no crontab yet.
fn read_table<R: Remote>(remote: &R) -> Result<Option<String>, String> {
    let out = remote.exec(READ_TABLE).map_err(|err| format!("{err:#}"))?;
    if out.success() {
        return Ok(Some(out.stdout));
    }
    if out.stderr.to_ascii_lowercase().contains("no crontab") {
        return Ok(None);
    }
    Err(describe(&out))
}

fn describe(out: &ExecOutput) -> String {
    if out.timed_out {
        return "timed out".to_string();
    }
    let stderr = out.stderr.trim();
    if stderr.is_empty() {
        format!("exit {:?}", out.code)
    } else {
        stderr.to_string()
    }
}

fn warning(message: String) -> ScheduleOutcome {
    warn!("{message}");
    ScheduleOutcome::Warning(message)
}
