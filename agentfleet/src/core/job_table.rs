//! Marker-delimited patching of a shared job table (crontab).
//!
//! The table is treated as an ordered list of opaque regions. Only the region
//! framed by this profile's begin/end markers is ever replaced; every other
//! line keeps its bytes and its relative order.

use std::fmt;

use thiserror::Error;

/// One periodic job declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronJob {
    pub schedule: String,
    pub command: String,
}

impl fmt::Display for CronJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.schedule, self.command)
    }
}

/// Begin/end marker lines owned by a single profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMarkers {
    pub begin: String,
    pub end: String,
}

impl BlockMarkers {
    pub fn for_profile(profile: &str) -> Self {
        Self {
            begin: format!("# >>> agentfleet:{profile} >>>"),
            end: format!("# <<< agentfleet:{profile} <<<"),
        }
    }
}

/// A contiguous slice of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    /// Lines not owned by this profile, kept verbatim.
    Foreign(Vec<String>),
    /// Lines between (and including) this profile's markers.
    Owned(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobTableError {
    /// A begin marker with no end marker; the owned extent is unknown.
    #[error("begin marker on line {line} has no matching end marker; refusing to rewrite")]
    Unterminated { line: usize },
}

/// Split `table` into foreign and owned regions.
pub fn parse_regions(table: &str, markers: &BlockMarkers) -> Result<Vec<Region>, JobTableError> {
    let mut regions = Vec::new();
    let mut foreign: Vec<String> = Vec::new();
    let mut owned: Option<(usize, Vec<String>)> = None;

    for (idx, line) in table.lines().enumerate() {
        match owned.as_mut() {
            Some((_, lines)) => {
                lines.push(line.to_string());
                if line.trim_end() == markers.end {
                    if let Some((_, lines)) = owned.take() {
                        regions.push(Region::Owned(lines));
                    }
                }
            }
            None if line.trim_end() == markers.begin => {
                if !foreign.is_empty() {
                    regions.push(Region::Foreign(std::mem::take(&mut foreign)));
                }
                owned = Some((idx + 1, vec![line.to_string()]));
            }
            None => foreign.push(line.to_string()),
        }
    }

    if let Some((line, _)) = owned {
        return Err(JobTableError::Unterminated { line });
    }
    if !foreign.is_empty() {
        regions.push(Region::Foreign(foreign));
    }
    Ok(regions)
}

/// Render the owned block for `profile`, markers included, newline-terminated.
pub fn render_block(markers: &BlockMarkers, jobs: &[CronJob]) -> String {
    let mut out = String::new();
    out.push_str(&markers.begin);
    out.push('\n');
    for job in jobs {
        out.push_str(&job.to_string());
        out.push('\n');
    }
    out.push_str(&markers.end);
    out.push('\n');
    out
}

/// Produce the new table: existing foreign regions in order, every old owned
/// region dropped, one fresh owned block appended.
///
/// `None` (no table yet) is treated as empty. Applying the patch twice with
/// the same jobs yields the same bytes.
pub fn patch_table(
    existing: Option<&str>,
    markers: &BlockMarkers,
    jobs: &[CronJob],
) -> Result<String, JobTableError> {
    let regions = parse_regions(existing.unwrap_or_default(), markers)?;
    let mut out = String::new();
    for region in regions {
        if let Region::Foreign(lines) = region {
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
    }
    out.push_str(&render_block(markers, jobs));
    Ok(out)
}
