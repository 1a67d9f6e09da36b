//! Renders the local front-end's configuration file from the daemon's
//! parsed groups and reloads the running process.
use crate::daemon::config::GroupConfig;
use indoc::formatdoc;
use snafu::{ResultExt, Snafu};
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to write front-end configuration to {path}"))]
    Write { path: String, source: std::io::Error },
    #[snafu(display("failed to run reload command {command:?}"))]
    Reload { command: String, source: std::io::Error },
    #[snafu(display("reload command {command:?} exited with status {status}"))]
    ReloadFailed { command: String, status: std::process::ExitStatus },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One `stream { server { ... } }` block per group; TCP and HTTP groups
/// both render as stream blocks, since this front-end only proxies —
/// path-based routing the reconcile engine assigns is consumed upstream
/// of this daemon, not re-derived here.
pub fn render(groups: &[GroupConfig]) -> String {
    let blocks: String = groups
        .iter()
        .map(|group| {
            let upstream_name = format!("upstream_{}", group.name);
            let servers: String = group
                .members
                .iter()
                .map(|m| format!("        server {}:{};\n", m.address, m.port))
                .collect();
            formatdoc! {"
            upstream {upstream_name} {{
            {servers}    }}

            server {{
                listen {bind_ip}:{bind_port};
                proxy_pass {upstream_name};
            }}
            ",
                bind_ip = group.bind_ip,
                bind_port = group.bind_port,
            }
        })
        .collect();

    formatdoc! {"
    # generated by the backend daemon, do not edit by hand
    stream {{
    {blocks}}}
    "}
}

pub async fn write_and_reload(path: &Path, groups: &[GroupConfig], reload_command: &[String]) -> Result<()> {
    let rendered = render(groups);
    tokio::fs::write(path, rendered).await.context(WriteSnafu {
        path: path.display().to_string(),
    })?;
    reload(reload_command).await
}

async fn reload(reload_command: &[String]) -> Result<()> {
    let Some((program, args)) = reload_command.split_first() else {
        return Ok(());
    };
    let command_display = reload_command.join(" ");
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .context(ReloadSnafu {
            command: command_display.clone(),
        })?;
    if !status.success() {
        return ReloadFailedSnafu {
            command: command_display,
            status,
        }
        .fail();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::config::Member;

    #[test]
    fn renders_one_stream_block_per_group() {
        let groups = vec![GroupConfig {
            name: "web".to_string(),
            host: "example.com".to_string(),
            protocol: "tcp".to_string(),
            bind_ip: "10.0.0.5".parse().unwrap(),
            bind_port: 443,
            members: vec![Member {
                address: "10.1.0.1".parse().unwrap(),
                port: 31000,
            }],
        }];
        let rendered = render(&groups);
        assert!(rendered.contains("upstream upstream_web"));
        assert!(rendered.contains("server 10.1.0.1:31000;"));
        assert!(rendered.contains("listen 10.0.0.5:443;"));
    }

    #[test]
    fn empty_groups_still_renders_a_valid_stream_block() {
        let rendered = render(&[]);
        assert!(rendered.contains("stream {"));
    }
}
