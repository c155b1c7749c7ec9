//! Fleet deployer CLI.
//!
//! Pushes the operator's repository to every node in `config/nodes.yaml`,
//! provisions secrets, installs maintenance jobs and restarts the managed
//! service. Every command is safe to re-run.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use agentfleet::core::types::DeploymentJob;
use agentfleet::deploy::{DeployArgs, run_deploy, run_deploy_all};
use agentfleet::exit_codes;
use agentfleet::io::config::{DeployConfig, load_config};
use agentfleet::io::connect::SshConnector;
use agentfleet::io::deploy_key::KeyInstall;
use agentfleet::io::layout::OperatorPaths;
use agentfleet::io::notify::TelegramSender;
use agentfleet::io::remote::local_tool_available;
use agentfleet::logging;
use agentfleet::nodes::{add_node, install_deploy_key};
use agentfleet::notify::{NotifyArgs, run_notify};

#[derive(Parser)]
#[command(
    name = "agentfleet",
    version,
    about = "Idempotent deployer for a fleet of managed agent hosts"
)]
struct Cli {
    /// Operator repository root (holds config/, secrets/, release_notes/).
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,
    /// Deployer settings [default: <root>/config/agentfleet.toml].
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy one profile to one host.
    Deploy {
        profile: String,
        host: String,
        #[arg(env = "DEPLOY_USER")]
        user: Option<String>,
        /// Bot token (else <PROFILE>_BOT_TOKEN, else secrets/<profile>/).
        token: Option<String>,
        pairing_code: Option<String>,
        llm_key: Option<String>,
        /// Check out this repository on the host instead of pushing the local tree.
        #[arg(env = "DEPLOY_REPO_URL")]
        repo_url: Option<String>,
        #[arg(env = "DEPLOY_BRANCH", default_value = "main")]
        branch: String,
    },
    /// Deploy every node in config/nodes.yaml.
    #[command(name = "deploy_all", visible_alias = "deploy-all")]
    DeployAll,
    /// Add or update a registry entry.
    #[command(name = "add_node", visible_alias = "add-node")]
    AddNode {
        name: String,
        host: String,
        user: Option<String>,
    },
    /// Authorize the deploy key on a host, using your own SSH identity.
    #[command(name = "install_deploy_key", visible_alias = "install-deploy-key")]
    InstallDeployKey {
        node: String,
        host: Option<String>,
        user: Option<String>,
    },
    /// Send release_notes/<profile>.md to the profile's Telegram chat.
    Notify {
        profile: String,
        host: Option<String>,
        user: Option<String>,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let mut paths = OperatorPaths::new(root);
    if let Some(config) = cli.config {
        paths = paths.with_config(config);
    }
    let cfg = load_config(&paths.config_path)?;

    match cli.command {
        Command::Deploy {
            profile,
            host,
            user,
            token,
            pairing_code,
            llm_key,
            repo_url,
            branch,
        } => {
            let args = DeployArgs {
                profile,
                host,
                user,
                token,
                pairing_code,
                llm_key,
                repo_url,
                branch,
            };
            cmd_deploy(&paths, &cfg, &args)
        }
        Command::DeployAll => cmd_deploy_all(&paths, &cfg),
        Command::AddNode { name, host, user } => {
            let node = add_node(&paths, &name, &host, user.as_deref())?;
            println!(
                "{}: {} -> {}{}",
                paths.registry_path.display(),
                node.id,
                node.user.map(|u| format!("{u}@")).unwrap_or_default(),
                node.host
            );
            Ok(exit_codes::OK)
        }
        Command::InstallDeployKey { node, host, user } => {
            let connector = SshConnector::from_config(&cfg);
            let (target, result) = install_deploy_key(
                &paths,
                &cfg,
                &connector,
                &node,
                host.as_deref(),
                user.as_deref(),
            )?;
            match result {
                KeyInstall::Added => println!("deploy key added on {}", target.destination()),
                KeyInstall::AlreadyPresent => {
                    println!("deploy key already present on {}", target.destination())
                }
            }
            Ok(exit_codes::OK)
        }
        Command::Notify {
            profile,
            host,
            user,
        } => {
            let connector = SshConnector::from_config(&cfg);
            let args = NotifyArgs {
                profile,
                host,
                user,
            };
            let report = run_notify(&paths, &cfg, &connector, &args, |token| {
                TelegramSender::new(token, cfg.connect_timeout() * 3)
            })?;
            println!(
                "sent {} characters to chat {}",
                report.characters, report.chat_id
            );
            Ok(exit_codes::OK)
        }
    }
}

fn require_local_tools(need_rsync: bool) -> Result<()> {
    if !local_tool_available("ssh", "-V") {
        return Err(anyhow!("ssh is not installed on this machine"));
    }
    if need_rsync && !local_tool_available("rsync", "--version") {
        return Err(anyhow!("rsync is not installed on this machine"));
    }
    Ok(())
}

fn cmd_deploy(paths: &OperatorPaths, cfg: &DeployConfig, args: &DeployArgs) -> Result<i32> {
    let git_mode = args
        .repo_url
        .as_deref()
        .is_some_and(|url| !url.trim().is_empty());
    require_local_tools(!git_mode)?;
    let connector = SshConnector::from_config(cfg);
    let job = run_deploy(paths, cfg, &connector, args)?;
    print_job(&job, cfg);
    if job.succeeded() {
        Ok(exit_codes::OK)
    } else {
        println!(
            "retry with: agentfleet deploy {} {}",
            job.profile, job.host
        );
        Ok(exit_codes::NODE_FAILED)
    }
}

fn cmd_deploy_all(paths: &OperatorPaths, cfg: &DeployConfig) -> Result<i32> {
    require_local_tools(true)?;
    let connector = SshConnector::from_config(cfg);
    let summary = run_deploy_all(paths, cfg, &connector, |job| {
        println!("{} ({}): {}", job.profile, job.host, job.reason());
    })?;
    for line in summary.render() {
        println!("{line}");
    }
    for job in summary.succeeded() {
        println!(
            "verify: curl http://{}:{}/health",
            job.host, cfg.service.health_port
        );
    }
    Ok(fleet_exit_code(
        summary.success_count(),
        summary.failure_count(),
    ))
}

fn fleet_exit_code(succeeded: usize, failed: usize) -> i32 {
    match (succeeded, failed) {
        (_, 0) => exit_codes::OK,
        (0, _) => exit_codes::NODE_FAILED,
        _ => exit_codes::PARTIAL,
    }
}

fn print_job(job: &DeploymentJob, cfg: &DeployConfig) {
    if job.succeeded() {
        println!("ok     {} ({})", job.profile, job.host);
        for warning in &job.warnings {
            println!("       warning: {warning}");
        }
        println!(
            "       verify: curl http://{}:{}/health",
            job.host, cfg.service.health_port
        );
    } else {
        println!("FAILED {} ({}): {}", job.profile, job.host, job.reason());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_deploy_positionals() {
        let cli = Cli::parse_from([
            "agentfleet",
            "deploy",
            "alice",
            "alice.lan",
            "pi",
            "123:abc",
        ]);
        match cli.command {
            Command::Deploy {
                profile,
                host,
                user,
                token,
                pairing_code,
                ..
            } => {
                assert_eq!(profile, "alice");
                assert_eq!(host, "alice.lan");
                assert_eq!(user.as_deref(), Some("pi"));
                assert_eq!(token.as_deref(), Some("123:abc"));
                assert_eq!(pairing_code, None);
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn parse_underscore_and_dash_names() {
        assert!(matches!(
            Cli::parse_from(["agentfleet", "deploy_all"]).command,
            Command::DeployAll
        ));
        assert!(matches!(
            Cli::parse_from(["agentfleet", "deploy-all"]).command,
            Command::DeployAll
        ));
        assert!(matches!(
            Cli::parse_from(["agentfleet", "add_node", "bob", "bob.lan"]).command,
            Command::AddNode { .. }
        ));
    }

    #[test]
    fn parse_global_root_after_subcommand() {
        let cli = Cli::parse_from(["agentfleet", "deploy_all", "--root", "/srv/fleet"]);
        assert_eq!(cli.root, Some(PathBuf::from("/srv/fleet")));
    }

    #[test]
    fn fleet_exit_codes_distinguish_partial_failure() {
        assert_eq!(fleet_exit_code(3, 0), exit_codes::OK);
        assert_eq!(fleet_exit_code(0, 0), exit_codes::OK);
        assert_eq!(fleet_exit_code(2, 1), exit_codes::PARTIAL);
        assert_eq!(fleet_exit_code(0, 2), exit_codes::NODE_FAILED);
    }
}
