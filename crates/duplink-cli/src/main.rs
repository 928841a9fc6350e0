//! Duplink CLI
//!
//! 命令行客户端：扫描对端、发送/接收单个文件，或保持连接等待对端发起

mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use duplink_core::{
    ChannelObserver, Gateway, GatewayHandle, GatewaySettings, LogLevel, PeerLink, PeerScanner,
    SessionUpdate, resolve_peer,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

use output::{Printer, ScanPrinter};

#[derive(Parser)]
#[command(name = "duplink", version, about = "BLE 控制 + RFCOMM 数据的双通道文件传输")]
struct Cli {
    /// 显示状态转换和调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    /// 以 JSON 行输出
    #[arg(long, global = true)]
    json: bool,

    /// 状态行的最低显示级别 (error/warn/info/debug)，默认 info，--verbose 时 debug
    #[arg(long, global = true, value_name = "LEVEL")]
    level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近的对端设备
    Scan {
        /// 扫描超时时间 (秒)，默认取配置
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// 发送文件
    Send {
        /// 要发送的文件路径
        file: PathBuf,
        /// 对端地址 (不指定则按名称扫描)
        #[arg(short, long)]
        device: Option<String>,
    },
    /// 接收对端的下一个文件
    Receive {
        /// 保存目录 (默认取配置)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// 保存为指定文件，忽略对端给出的文件名
        #[arg(long, conflicts_with = "output")]
        destination: Option<PathBuf>,
        #[arg(short, long)]
        device: Option<String>,
    },
    /// 保持连接，自动接收对端推送的文件，对端请求时发送 `--offer` 指定的文件
    Listen {
        #[arg(long)]
        offer: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        device: Option<String>,
    },
    /// 查看或初始化配置文件
    Config {
        /// 把当前设置写入配置文件
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = GatewaySettings::load();
    let verbose = cli.verbose || settings.verbose;
    init_logging(verbose);

    let level = cli
        .level
        .unwrap_or(if verbose { LogLevel::Debug } else { LogLevel::Info });
    let mut printer = Printer::new(cli.json, level);

    match cli.command {
        Commands::Scan { timeout } => {
            let timeout = timeout.map_or_else(|| settings.scan_timeout(), Duration::from_secs);
            if !cli.json {
                println!("🔍 扫描 '{}' ({}s)...", settings.peer_name, timeout.as_secs());
            }
            let scanner = PeerScanner::new().await?;
            let callback = Arc::new(ScanPrinter { json: cli.json });
            let peers = scanner
                .scan(&settings.peer_name, timeout, false, Some(callback))
                .await?;
            if peers.is_empty() && !cli.json {
                println!("   未发现设备");
            }
        }
        Commands::Send { file, device } => {
            apply_device(&mut settings, device);
            let (gateway, mut updates) = connect(&settings).await?;
            let handle = gateway.handle();
            handle.request_upload(file);
            let result = wait_for_transfer(&handle, &mut updates, &mut printer).await;
            gateway.shutdown().await;
            result?;
        }
        Commands::Receive {
            output,
            destination,
            device,
        } => {
            apply_device(&mut settings, device);
            if let Some(dir) = output {
                settings.download_dir = dir;
            }
            let (gateway, mut updates) = connect(&settings).await?;
            let handle = gateway.handle();
            handle.request_download(destination);
            let result = wait_for_transfer(&handle, &mut updates, &mut printer).await;
            gateway.shutdown().await;
            result?;
        }
        Commands::Listen {
            offer,
            output,
            device,
        } => {
            apply_device(&mut settings, device);
            if let Some(dir) = output {
                settings.download_dir = dir;
            }
            settings.auto_accept = true;
            let (gateway, mut updates) = connect(&settings).await?;
            let handle = gateway.handle();
            if offer.is_some() {
                handle.offer_file(offer);
            }

            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(update) => printer.print(&update),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupted, shutting down");
                        break;
                    }
                }
            }
            gateway.shutdown().await;
        }
        Commands::Config { init } => {
            let path = GatewaySettings::config_path();
            if init {
                settings.save()?;
                println!("已写入 {}", path.display());
            } else if cli.json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                println!("# {}", path.display());
                print!("{}", toml_string(&settings)?);
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（duplink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if verbose {
        "debug,duplink_core=debug"
    } else {
        "info,duplink_core=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn apply_device(settings: &mut GatewaySettings, device: Option<String>) {
    if device.is_some() {
        settings.peer_address = device;
    }
}

async fn connect(
    settings: &GatewaySettings,
) -> Result<(Gateway, UnboundedReceiver<SessionUpdate>)> {
    let peer: PeerLink = resolve_peer(settings).await?;
    let (observer, updates) = ChannelObserver::new();
    let gateway = Gateway::connect(settings, &peer, observer).await?;
    Ok((gateway, updates))
}

/// 打印更新直到一次传输结束；失败时返回错误
async fn wait_for_transfer(
    handle: &GatewayHandle,
    updates: &mut UnboundedReceiver<SessionUpdate>,
    printer: &mut Printer,
) -> Result<()> {
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    bail!("连接已断开");
                };
                printer.print(&update);
                match update {
                    SessionUpdate::Complete(_) => return Ok(()),
                    SessionUpdate::Error { message } => bail!(message),
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                bail!("已取消");
            }
        }
    }
}

fn toml_string(settings: &GatewaySettings) -> Result<String> {
    Ok(toml::to_string_pretty(settings)?)
}
