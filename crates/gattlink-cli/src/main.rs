//! Gattlink CLI
//!
//! 命令行客户端：连接外围设备，发送一次请求并打印响应

mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use gattlink_core::{BleConnector, TransferClient, TransferConfig};
use tracing_subscriber::EnvFilter;

use crate::output::TransferSummary;

#[derive(Parser)]
#[command(name = "gattlink", version, about = "BLE GATT 分片请求/响应工具")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 发送请求并等待响应
    Send {
        /// 目标设备地址 (不指定则使用配置文件中的 device_address)
        #[arg(short, long)]
        device: Option<String>,
        /// 从文件读取请求
        #[arg(short, long, conflicts_with = "text", required_unless_present = "text")]
        file: Option<PathBuf>,
        /// 直接发送文本请求
        #[arg(short, long)]
        text: Option<String>,
        /// 响应保存路径 (默认打印到标准输出)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// 覆盖配置中的 MTU
        #[arg(long)]
        mtu: Option<usize>,
        /// 以 JSON 输出结果摘要
        #[arg(long)]
        json: bool,
    },
    /// 管理配置文件
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 打印当前生效的配置
    Show,
    /// 写入默认配置文件
    Init {
        /// 覆盖已有文件
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TransferConfig::load();

    // 桥接 log crate（gattlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志，输出到 stderr 以免混入响应内容
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.filter_directive())),
        )
        .try_init();

    match cli.command {
        Commands::Send {
            device,
            file,
            text,
            output,
            mtu,
            json,
        } => {
            let payload = match (file, text) {
                (Some(path), _) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, Some(text)) => text.into_bytes(),
                (None, None) => bail!("Either --file or --text is required"),
            };
            let mut config = config;
            if let Some(mtu) = mtu {
                config.mtu = mtu;
            }
            let device = device
                .or_else(|| config.device_address.clone())
                .context("No device address (use --device or set device_address in settings)")?;

            send(config, &device, payload, output, json).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("# {}", TransferConfig::config_path().display());
                print!("{}", config.to_toml()?);
            }
            ConfigAction::Init { force } => {
                let path = TransferConfig::config_path();
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                TransferConfig::default().save()?;
                println!("Wrote default settings to {}", path.display());
            }
        },
    }

    Ok(())
}

async fn send(
    config: TransferConfig,
    device: &str,
    payload: Vec<u8>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let connector = BleConnector::new(config.clone()).on_connected(|info| {
        tracing::info!("Connection established with {} (MTU {})", info.address, info.mtu);
    });
    let transport = Arc::new(
        connector
            .connect(device)
            .await
            .with_context(|| format!("Failed to connect to {device}"))?,
    );

    let client = TransferClient::new(transport.clone(), config);
    let request_bytes = payload.len();
    let handle = client.begin_transfer(payload).await?;

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling transfer");
            cancel.cancel();
        }
    });

    let states = handle.state_changes();
    let result = handle.wait().await;
    let state = *states.borrow();

    if let Err(e) = transport.disconnect().await {
        tracing::warn!("Disconnect failed: {}", e);
    }

    let mut summary = TransferSummary::new(device, request_bytes, state, &result);
    if let Ok(response) = &result {
        match &output {
            Some(path) => {
                tokio::fs::write(path, &response.data)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                summary.output = Some(path.display().to_string());
            }
            None if !json => println!("{}", String::from_utf8_lossy(&response.data)),
            None => summary.response = Some(String::from_utf8_lossy(&response.data).into_owned()),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        eprintln!("{summary}");
    }

    result.map(|_| ()).map_err(anyhow::Error::from)
}
