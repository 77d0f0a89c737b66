//! Concierge 命令行入口
//!
//! 初始化日志、按配置构建 Concierge，逐行读取 stdin 作为用户消息；回答写到 stdout，Trajectory 写到 stderr。
//! 用法：`concierge [config.toml] [session-key]`

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use concierge::config::load_config;
use concierge::react::{TurnEvent, TurnStatus};
use concierge::{observability, Concierge};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let session_key = args.next().unwrap_or_else(|| "cli".to_string());

    let cfg = load_config(config_path).context("Failed to load config")?;
    let concierge = Arc::new(Concierge::from_config(&cfg).context("Failed to build concierge")?);
    tracing::info!(tools = ?concierge.tool_names(), "{} ready", concierge.name());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut handle = concierge.run_turn(session_key.clone(), line);
        while let Some(ev) = handle.events.recv().await {
            match ev {
                TurnEvent::TextDelta { text } => {
                    print!("{text}");
                    std::io::stdout().flush()?;
                }
                TurnEvent::Trajectory(t) => eprintln!("[{}] {}", t.title, t.content),
                TurnEvent::Citations { citations } => {
                    for c in citations {
                        eprintln!("[citation] {} {}", c.label, c.url.as_deref().unwrap_or(""));
                    }
                }
                TurnEvent::Status { status } => match status {
                    TurnStatus::Success { .. } => println!(),
                    TurnStatus::Aborted { reason } => eprintln!("aborted: {reason}"),
                },
            }
        }
    }
    Ok(())
}
