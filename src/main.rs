//! sshpane - SSH terminal and SFTP client
//!
//! Stores connection profiles in an encrypted vault, opens interactive
//! shell sessions, runs remote commands and moves files over SFTP.
//!
//! # Quick Start
//!
//! ```text
//! sshpane profile add web deploy@web.example.com:2222
//! sshpane connect web
//! sshpane put web ./site /var/www/site
//! ```

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use crossterm::event::{
    self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEventKind, KeyModifiers,
};
use crossterm::{execute, terminal};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sshpane::config::{app_dir, Config};
use sshpane::connect::{connect_profile, SshConnector};
use sshpane::core::registry::{RegistryEvent, SessionRegistry};
use sshpane::core::session::SessionEvent;
use sshpane::core::term::{AnsiInterpreter, DisplayBuffer};
use sshpane::core::transport::{sort_entries, Transport};
use sshpane::transfer::{Progress, TransferEngine};
use sshpane::ui::keymapper::{encode_key, encode_paste, is_disconnect_key};
use sshpane::vault::{ListOrder, Profile, Vault, VaultStatus};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Event poll interval for the interactive loop
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// `user@host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    user: String,
    host: String,
    port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Help,
    Version,
    ProfileAdd {
        name: String,
        target: Target,
        description: String,
    },
    ProfileList {
        recent: bool,
    },
    ProfileRemove(String),
    ProfileShow(String),
    ProfileExport(PathBuf),
    ProfileImport(PathBuf),
    ProfileReset,
    Connect {
        profile: String,
        capture: Option<PathBuf>,
    },
    Exec {
        profile: String,
        command: String,
    },
    Ls {
        profile: String,
        path: String,
    },
    Put {
        profile: String,
        local: PathBuf,
        remote: String,
    },
    Get {
        profile: String,
        remote: String,
        local: PathBuf,
    },
}

fn print_help() {
    eprintln!("sshpane {} - SSH terminal and SFTP client", VERSION);
    eprintln!();
    eprintln!("Usage: sshpane <COMMAND>");
    eprintln!();
    eprintln!("Profiles:");
    eprintln!("  profile add <name> <user@host[:port]> [-d TEXT]");
    eprintln!("                        Save a profile (secret from SSHPANE_SECRET or prompt)");
    eprintln!("  profile list [--recent]");
    eprintln!("  profile show <name>");
    eprintln!("  profile rm <name>");
    eprintln!("  profile export <file>");
    eprintln!("  profile import <file>");
    eprintln!("  profile reset --force");
    eprintln!("                        Delete every saved profile (recovers a corrupt store)");
    eprintln!();
    eprintln!("Sessions:");
    eprintln!("  connect <profile> [--capture FILE]");
    eprintln!("                        Interactive shell; Ctrl+] disconnects");
    eprintln!("  exec <profile> <command...>");
    eprintln!();
    eprintln!("Files:");
    eprintln!("  ls <profile> [path]");
    eprintln!("  put <profile> <local> <remote>");
    eprintln!("  get <profile> <remote> <local>");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.sshpane/config.toml   Log: ~/.sshpane/sshpane.log");
}

fn parse_target(arg: &str) -> Result<Target, String> {
    let (user, rest) = arg
        .split_once('@')
        .ok_or_else(|| format!("Expected user@host[:port], got {}", arg))?;
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .map_err(|_| format!("Invalid port: {}", port))?,
        ),
        None => (rest, 22),
    };
    if user.is_empty() || host.is_empty() {
        return Err(format!("Expected user@host[:port], got {}", arg));
    }
    Ok(Target {
        user: user.to_string(),
        host: host.to_string(),
        port,
    })
}

/// Parse arguments (without the program name).
fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut positional = Vec::new();
    let mut capture = None;
    let mut description = String::new();
    let mut recent = false;
    let mut force = false;
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "--capture" => {
                i += 1;
                let path = args.get(i).ok_or("Missing --capture argument")?;
                capture = Some(PathBuf::from(path));
            }
            "-d" | "--description" => {
                i += 1;
                description = args.get(i).ok_or("Missing description argument")?.clone();
            }
            "--recent" => recent = true,
            "--force" => force = true,
            // Everything after the command of `exec` belongs to the remote command
            _ if positional.len() == 2 && positional[0] == "exec" => {
                positional.push(args[i..].join(" "));
                break;
            }
            arg if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let words: Vec<&str> = positional.iter().map(String::as_str).collect();
    let command = match words.as_slice() {
        [] => Command::Help,
        ["profile", "add", name, target] => Command::ProfileAdd {
            name: name.to_string(),
            target: parse_target(target)?,
            description,
        },
        ["profile", "list"] | ["profile", "ls"] => Command::ProfileList { recent },
        ["profile", "rm", name] => Command::ProfileRemove(name.to_string()),
        ["profile", "show", name] => Command::ProfileShow(name.to_string()),
        ["profile", "export", path] => Command::ProfileExport(PathBuf::from(path)),
        ["profile", "import", path] => Command::ProfileImport(PathBuf::from(path)),
        ["profile", "reset"] if force => Command::ProfileReset,
        ["profile", "reset"] => {
            return Err("profile reset deletes every saved profile; pass --force".to_string());
        }
        ["connect", profile] => Command::Connect {
            profile: profile.to_string(),
            capture,
        },
        ["exec", profile, command] => Command::Exec {
            profile: profile.to_string(),
            command: command.to_string(),
        },
        ["ls", profile] => Command::Ls {
            profile: profile.to_string(),
            path: ".".to_string(),
        },
        ["ls", profile, path] => Command::Ls {
            profile: profile.to_string(),
            path: path.to_string(),
        },
        ["put", profile, local, remote] => Command::Put {
            profile: profile.to_string(),
            local: PathBuf::from(local),
            remote: remote.to_string(),
        },
        ["get", profile, remote, local] => Command::Get {
            profile: profile.to_string(),
            remote: remote.to_string(),
            local: PathBuf::from(local),
        },
        _ => return Err(format!("Invalid command: {}. Use -h for help.", positional.join(" "))),
    };
    Ok(command)
}

fn init_logging() {
    let log_path = app_dir()
        .map(|dir| dir.join("sshpane.log"))
        .unwrap_or_else(|| PathBuf::from("sshpane.log"));

    if let Some(parent) = log_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            eprintln!("sshpane {}", VERSION);
            return Ok(());
        }
        _ => {}
    }

    init_logging();
    info!("sshpane {} starting", VERSION);

    let config = Config::load();
    let vault_dir = config
        .vault_dir()
        .ok_or_else(|| anyhow!("Could not determine the vault directory"))?;
    let vault = Vault::open(&vault_dir)
        .with_context(|| format!("Failed to open vault at {}", vault_dir.display()))?;
    if let VaultStatus::Corrupt(reason) = vault.status() {
        eprintln!("Warning: profile store is unreadable ({})", reason);
        eprintln!("Run `sshpane profile reset --force` to start over");
    }

    let result = run(command, &config, &vault);
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn run(command: Command, config: &Config, vault: &Vault) -> anyhow::Result<()> {
    match command {
        Command::Help | Command::Version => Ok(()),
        Command::ProfileAdd {
            name,
            target,
            description,
        } => {
            let secret = match env::var("SSHPANE_SECRET") {
                Ok(secret) => secret,
                Err(_) => read_secret(&format!("Password for {}@{}: ", target.user, target.host))?,
            };
            let profile = Profile::new(&name, target.host, target.user, secret)
                .with_port(target.port)
                .with_description(description);
            if !vault.save(&profile) {
                bail!("Could not save profile {}", name);
            }
            eprintln!("Saved profile {}", name);
            Ok(())
        }
        Command::ProfileList { recent } => {
            let order = if recent {
                ListOrder::Recent
            } else {
                ListOrder::Insertion
            };
            for name in vault.list(order) {
                println!("{}", name);
            }
            Ok(())
        }
        Command::ProfileRemove(name) => {
            if !vault.delete(&name) {
                bail!("No profile named {}", name);
            }
            eprintln!("Deleted profile {}", name);
            Ok(())
        }
        Command::ProfileShow(name) => {
            let profile = vault
                .load(&name)
                .ok_or_else(|| anyhow!("No readable profile named {}", name))?;
            println!("name:        {}", profile.name);
            println!("target:      {}@{}:{}", profile.username, profile.host, profile.port);
            println!("description: {}", profile.description);
            println!("created:     {}", format_time(profile.created));
            println!("last used:   {}", format_time(profile.last_used));
            Ok(())
        }
        Command::ProfileExport(path) => {
            if !vault.export(&path) {
                bail!("Could not export profiles to {}", path.display());
            }
            Ok(())
        }
        Command::ProfileImport(path) => {
            if !vault.import(&path) {
                bail!("Could not import profiles from {}", path.display());
            }
            Ok(())
        }
        Command::ProfileReset => {
            if !vault.reset() {
                bail!("Could not reset the profile store in {}", vault.dir().display());
            }
            eprintln!("Profile store cleared");
            Ok(())
        }
        Command::Connect { profile, capture } => {
            let transport = open_transport(config, vault, &profile)?;
            run_interactive(config, transport, &profile, capture.as_deref())
        }
        Command::Exec { profile, command } => {
            let transport = open_transport(config, vault, &profile)?;
            let output = transport
                .exec(&command, config.transport.exec_timeout())
                .with_context(|| format!("Failed to run {}", command))?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            io::stdout().flush()?;
            if !output.success() {
                std::process::exit(output.exit_code);
            }
            Ok(())
        }
        Command::Ls { profile, path } => {
            let transport = open_transport(config, vault, &profile)?;
            let fs = transport.open_fs()?;
            let mut entries = fs.list(&path).with_context(|| format!("Failed to list {}", path))?;
            sort_entries(&mut entries);
            for entry in entries {
                let suffix = if entry.is_dir() { "/" } else { "" };
                println!(
                    "{} {:>12} {}{}",
                    entry.stat.permissions(),
                    entry.stat.size,
                    entry.name,
                    suffix
                );
            }
            Ok(())
        }
        Command::Put {
            profile,
            local,
            remote,
        } => {
            let transport = open_transport(config, vault, &profile)?;
            let engine = TransferEngine::new(transport.open_fs()?)
                .with_chunk_size(config.transfer.chunk_size);
            let mut progress = progress_printer(&local.display().to_string());
            if local.is_dir() {
                let count = engine.upload_directory(&local, &remote, &mut progress)?;
                eprintln!("\nUploaded {} files", count);
            } else {
                engine.upload(&local, &remote, &mut progress)?;
                eprintln!();
            }
            Ok(())
        }
        Command::Get {
            profile,
            remote,
            local,
        } => {
            let transport = open_transport(config, vault, &profile)?;
            let fs = transport.open_fs()?;
            let is_dir = fs
                .stat(&remote)
                .with_context(|| format!("Failed to stat {}", remote))?
                .is_dir;
            let engine = TransferEngine::new(fs).with_chunk_size(config.transfer.chunk_size);
            let mut progress = progress_printer(&remote);
            if is_dir {
                let count = engine.download_directory(&remote, &local, &mut progress)?;
                eprintln!("\nDownloaded {} files", count);
            } else {
                engine.download(&remote, &local, &mut progress)?;
                eprintln!();
            }
            Ok(())
        }
    }
}

fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn progress_printer(label: &str) -> impl FnMut(&Progress) {
    let label = label.to_string();
    move |p: &Progress| {
        eprint!(
            "\r{} [{}] {:5.1}% {}/{} bytes {:.1} KiB/s",
            label, p.task_id, p.percent, p.bytes, p.total, p.rate_kbps
        );
    }
}

fn open_transport(
    config: &Config,
    vault: &Vault,
    profile: &str,
) -> anyhow::Result<std::sync::Arc<dyn Transport>> {
    let connector = SshConnector {
        fs_timeout: config.transport.exec_timeout(),
    };
    let mut failure = None;
    let transport = connect_profile(
        vault,
        &connector,
        profile,
        config.transport.connect_timeout(),
        &mut |ok, message| {
            if ok {
                eprintln!("{}", message);
            } else {
                failure = Some(message.to_string());
            }
        },
    );
    transport.ok_or_else(|| anyhow!(failure.unwrap_or_else(|| "Connection failed".to_string())))
}

/// Prompt for a secret without echo.
fn read_secret(prompt: &str) -> anyhow::Result<String> {
    eprint!("{}", prompt);
    io::stderr().flush()?;
    terminal::enable_raw_mode()?;
    let result = read_secret_raw();
    let _ = terminal::disable_raw_mode();
    eprintln!();
    result
}

fn read_secret_raw() -> anyhow::Result<String> {
    let mut secret = String::new();
    loop {
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Release {
                continue;
            }
            match key.code {
                KeyCode::Enter => return Ok(secret),
                KeyCode::Backspace => {
                    secret.pop();
                }
                KeyCode::Esc => bail!("Cancelled"),
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    bail!("Cancelled")
                }
                KeyCode::Char(c) => secret.push(c),
                _ => {}
            }
        }
    }
}

/// Interactive shell over one registry session.
fn run_interactive(
    config: &Config,
    transport: std::sync::Arc<dyn Transport>,
    name: &str,
    capture: Option<&Path>,
) -> anyhow::Result<()> {
    let (registry, events) = SessionRegistry::with_channel();
    let mut registry =
        registry.with_timeouts(config.transport.channel_timeout(), Duration::from_secs(1));
    let id = registry.create(transport, Some(name))?;

    let (cols, rows) =
        terminal::size().unwrap_or((config.terminal.cols, config.terminal.rows));
    registry
        .get_mut(&id)
        .ok_or_else(|| anyhow!("Session {} vanished", id))?
        .start(&config.terminal.term_type, cols, rows)?;
    info!("Interactive session {} ({}x{})", id, cols, rows);

    let mut interpreter = AnsiInterpreter::new();
    let mut buffer = DisplayBuffer::new(config.terminal.max_lines);

    terminal::enable_raw_mode()?;
    let _ = execute!(io::stdout(), EnableBracketedPaste);
    let result = interactive_loop(&mut registry, &id, &events, &mut interpreter, &mut buffer);
    let _ = execute!(io::stdout(), DisableBracketedPaste);
    let _ = terminal::disable_raw_mode();

    registry.close_all();
    eprintln!();

    if let Some(path) = capture {
        fs::write(path, buffer.text())
            .with_context(|| format!("Failed to write capture to {}", path.display()))?;
        info!("Captured {} lines to {}", buffer.line_count(), path.display());
    }
    result
}

fn interactive_loop(
    registry: &mut SessionRegistry,
    id: &str,
    events: &Receiver<RegistryEvent>,
    interpreter: &mut AnsiInterpreter,
    buffer: &mut DisplayBuffer,
) -> anyhow::Result<()> {
    let mut stdout = io::stdout();

    loop {
        // Drain session output
        loop {
            match events.try_recv() {
                Ok(RegistryEvent { event, .. }) => match event {
                    SessionEvent::Output(text) => {
                        stdout.write_all(text.as_bytes())?;
                        if let Some(title) = interpreter.process(&text, buffer) {
                            debug!("Title: {}", title);
                        }
                    }
                    SessionEvent::Exited => {
                        stdout.flush()?;
                        info!("Remote closed session {}", id);
                        return Ok(());
                    }
                    SessionEvent::Error(message) => {
                        stdout.flush()?;
                        bail!("Session {} failed: {}", id, message);
                    }
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
        stdout.flush()?;

        if !event::poll(POLL_INTERVAL)? {
            continue;
        }
        let Some(session) = registry.get_mut(id) else {
            return Ok(());
        };
        match event::read()? {
            Event::Key(key) => {
                if is_disconnect_key(&key) {
                    info!("Disconnect requested");
                    return Ok(());
                }
                if let Some(bytes) = encode_key(&key, &interpreter.modes()) {
                    session.send_bytes(&bytes);
                }
            }
            Event::Paste(text) => {
                session.send_bytes(&encode_paste(&text, &interpreter.modes()));
            }
            Event::Resize(cols, rows) => {
                debug!("Resize: {}x{}", cols, rows);
                session.resize(cols, rows);
            }
            _ => {}
        }
    }
}
