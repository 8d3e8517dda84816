use anyhow::Result;
use dotenv::dotenv;
use lan_file_share::networking::{AuthorizeCallback, Device, StatusCallback, TransferStatus};
use lan_file_share::{LocalNode, SessionConfig};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::net::IpAddr;
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// A transfer request waiting for `yes` or `no` on the terminal
struct PendingAuthorization {
    peer: IpAddr,
    file_name: String,
    reply: mpsc::Sender<bool>,
}

type PromptQueue = Arc<Mutex<VecDeque<PendingAuthorization>>>;

enum Input {
    Line(String),
    Shutdown,
}

fn print_separator() {
    println!("\n{}\n", "-".repeat(60));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = SessionConfig::from_env();
    info!(
        "Starting '{}' (discovery {}, communication {}, transfer {})",
        config.local_name, config.discovery_port, config.communication_port, config.transfer_port
    );
    info!("Files will be received in: {}", config.receive_dir.display());

    let prompts: PromptQueue = Arc::new(Mutex::new(VecDeque::new()));
    let authorize = terminal_authorizer(&config, prompts.clone());
    let status: StatusCallback = Arc::new(report_transfer);

    let node = Arc::new(LocalNode::new(config, authorize).with_status_callback(status));
    node.start().await?;
    if let Some(addr) = node.transfer_address() {
        info!("Accepting transfers on {}", addr);
    }

    let (input_tx, mut input_rx) = unbounded_channel();
    let ctrlc_tx = input_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Input::Shutdown);
    })?;
    spawn_stdin_reader(input_tx);

    print_separator();
    print_help();

    while let Some(input) = input_rx.recv().await {
        let line = match input {
            Input::Line(line) => line,
            Input::Shutdown => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match command.to_lowercase().as_str() {
            "help" | "h" => print_help(),
            "list" | "ls" => print_devices(&node.list_devices()),
            "json" => match serde_json::to_string_pretty(&node.list_devices()) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Failed to serialize device list: {}", e),
            },
            "refresh" => {
                if let Err(e) = node.refresh().await {
                    error!("Refresh failed: {:#}", e);
                }
            }
            "send" => {
                let Some((target, path)) = rest.trim().split_once(char::is_whitespace) else {
                    error!("Usage: send <ip|name> <file_path>");
                    continue;
                };

                let Some(ip) = resolve_target(&node, target) else {
                    error!("Device not found: {}", target);
                    continue;
                };

                // Keep the prompt free while the peer decides
                let node = node.clone();
                let path = path.trim().to_string();
                tokio::spawn(async move {
                    println!("Sending {} to {}...", path, ip);
                    println!("{}", node.send_file(&path, ip).await);
                });
            }
            "yes" | "y" => answer_oldest(&prompts, true),
            "no" | "n" => answer_oldest(&prompts, false),
            "exit" | "quit" | "q" => break,
            _ => {
                error!("Unknown command: {}", command);
                print_help();
            }
        }
    }

    info!("Shutting down...");
    node.stop().await;
    Ok(())
}

/// Build the authorization callback: auto-accept, or queue a prompt and wait
/// for the answer until the prompt timeout runs out.
fn terminal_authorizer(config: &SessionConfig, prompts: PromptQueue) -> AuthorizeCallback {
    let auto_accept = config.auto_accept;
    let wait = config.prompt_timeout();

    Arc::new(move |peer: IpAddr, file_name: &str| {
        if auto_accept {
            info!("Auto-accepting {} from {}", file_name, peer);
            return true;
        }

        let (reply, answer) = mpsc::channel();
        prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(PendingAuthorization {
                peer,
                file_name: file_name.to_string(),
                reply,
            });
        println!(
            "\n{} wants to send you '{}'. Accept? (yes/no, {}s)",
            peer,
            file_name,
            wait.as_secs()
        );

        answer.recv_timeout(wait).unwrap_or_else(|_| {
            warn!("No answer for {} from {}, refusing", file_name, peer);
            false
        })
    })
}

/// Answer the oldest request that is still waiting
fn answer_oldest(prompts: &PromptQueue, accept: bool) {
    let mut queue = prompts.lock().unwrap_or_else(PoisonError::into_inner);
    while let Some(request) = queue.pop_front() {
        // A failed send means that prompt already timed out
        if request.reply.send(accept).is_ok() {
            let verdict = if accept { "Accepted" } else { "Refused" };
            println!("{} '{}' from {}", verdict, request.file_name, request.peer);
            return;
        }
        debug!("Skipping expired prompt for {}", request.file_name);
    }
    println!("No transfer is waiting for an answer");
}

fn resolve_target(node: &LocalNode, target: &str) -> Option<IpAddr> {
    match target.parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        Err(_) => node.device_by_name(target).map(|device| device.ip),
    }
}

fn spawn_stdin_reader(tx: UnboundedSender<Input>) {
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(Input::Line(line)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("Failed to read from stdin: {}", e);
                    break;
                }
            }
        }
        let _ = tx.send(Input::Shutdown);
    });
}

fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("No devices discovered yet");
        return;
    }

    println!("Discovered devices:");
    for (i, device) in devices.iter().enumerate() {
        println!("  {}. {} ({})", i + 1, device.name, device.ip);
    }
    let _ = io::stdout().flush();
}

fn print_help() {
    println!("Available commands:");
    println!("  help, h                - Show this help");
    println!("  list, ls               - List discovered devices");
    println!("  json                   - Print the device list as JSON");
    println!("  refresh                - Announce again and drop unreachable devices");
    println!("  send <ip|name> <file>  - Send a file to a device");
    println!("  yes, y / no, n         - Answer the oldest transfer request");
    println!("  exit, quit, q          - Exit the application");
}

fn report_transfer(status: TransferStatus) {
    match status {
        TransferStatus::Requested { peer, file_name, .. } => {
            info!("Transfer requested: {} from {}", file_name, peer);
        }
        TransferStatus::Rejected { peer, file_name, .. } => {
            info!("Transfer refused: {} from {}", file_name, peer);
        }
        TransferStatus::Completed {
            path,
            bytes_received,
            elapsed_seconds,
            ..
        } => {
            let size_mb = bytes_received as f64 / (1024.0 * 1024.0);
            info!(
                "✅ Transfer completed: {} ({:.2} MB in {:.2}s)",
                path.display(),
                size_mb,
                elapsed_seconds
            );
        }
        TransferStatus::Failed { peer, error, .. } => {
            error!("❌ Transfer from {} failed: {}", peer, error);
        }
    }
}
