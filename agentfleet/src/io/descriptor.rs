//! Per-profile systemd user unit.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::profile::RemoteLayout;
use crate::io::remote::home_path;

const UNIT_TEMPLATE: &str = include_str!("templates/service.unit.j2");

/// Render the unit for `layout`, run as `user`.
pub fn render_unit(layout: &RemoteLayout, user: &str) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("unit", UNIT_TEMPLATE)
        .context("load unit template")?;
    let template = env.get_template("unit")?;
    let mut rendered = template
        .render(context! {
            profile => &layout.profile,
            user => user,
            install_root => &layout.install_root,
            venv_dir => &layout.venv_dir,
            service_log => &layout.service_log,
            entry_args => layout.entry_args(),
        })
        .context("render unit template")?;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

/// Script that installs the unit read from stdin, replacing any previous one.
pub fn write_unit_script(layout: &RemoteLayout) -> String {
    let tmp = format!("{}.tmp", layout.unit_path);
    let dir = layout
        .unit_path
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or(".");
    format!(
        "set -e\nmkdir -p {dir}\ncat > {tmp}\nmv -f {tmp} {unit}\n",
        dir = home_path(dir),
        tmp = home_path(&tmp),
        unit = home_path(&layout.unit_path),
    )
}

/// Reload the user manager and enable the unit for the next boot.
pub fn register_unit_script(layout: &RemoteLayout) -> String {
    format!(
        "systemctl --user daemon-reload && systemctl --user enable {}",
        layout.unit_name
    )
}
