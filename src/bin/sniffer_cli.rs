//! Sniffer control client
//!
//! Sends commands to a running snifferd over its Unix datagram control
//! socket and prints the replies. Commands come from the command line, or
//! one per line from stdin when none is given.

use airsniff::DEFAULT_CTRL_IFACE;
use clap::{Arg, ArgAction, Command};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixDatagram;

/// Largest reply accepted
const MAX_REPLY_LEN: usize = 256 * 1024;

fn cli() -> Command {
    Command::new("sniffer-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Control client for snifferd")
        .arg(
            Arg::new("socket")
                .short('s')
                .long("socket")
                .value_name("PATH")
                .help("Daemon control socket")
                .default_value(DEFAULT_CTRL_IFACE),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECS")
                .help("Seconds to wait for each reply")
                .value_parser(clap::value_parser!(u64))
                .default_value("2"),
        )
        .arg(
            Arg::new("command")
                .value_name("COMMAND")
                .help("Command to send (status, stations, aps, hop on|off, stop)")
                .num_args(1..)
                .action(ArgAction::Append),
        )
}

/// Client socket bound to a private path, removed on drop
struct Client {
    socket: UnixDatagram,
    local: PathBuf,
    server: PathBuf,
    timeout: Duration,
}

impl Client {
    fn connect(server: &Path, timeout: Duration) -> io::Result<Self> {
        let local = std::env::temp_dir().join(format!("sniffer-cli-{}.sock", process::id()));
        let _ = std::fs::remove_file(&local);
        let socket = UnixDatagram::bind(&local)?;
        Ok(Self {
            socket,
            local,
            server: server.to_path_buf(),
            timeout,
        })
    }

    /// Send one command and wait for its reply
    async fn request(&self, command: &str) -> io::Result<Option<String>> {
        self.socket.send_to(command.as_bytes(), &self.server).await?;

        let mut buf = vec![0u8; MAX_REPLY_LEN];
        match tokio::time::timeout(self.timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned())),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local);
    }
}

async fn run(client: &Client, command: Option<String>) -> io::Result<()> {
    if let Some(command) = command {
        return print_reply(client, &command).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        print_reply(client, command).await?;
    }
    Ok(())
}

async fn print_reply(client: &Client, command: &str) -> io::Result<()> {
    match client.request(command).await? {
        Some(reply) => println!("{}", reply),
        None => eprintln!("sniffer-cli: no reply to {:?} within {:?}", command, client.timeout),
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let matches = cli().get_matches();

    let server = matches
        .get_one::<String>("socket")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CTRL_IFACE));
    let timeout = Duration::from_secs(matches.get_one::<u64>("timeout").copied().unwrap_or(2));
    let command = matches
        .get_many::<String>("command")
        .map(|words| words.cloned().collect::<Vec<_>>().join(" "));

    let client = match Client::connect(&server, timeout) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("sniffer-cli: failed to open client socket: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(&client, command).await {
        eprintln!("sniffer-cli: {}: {}", server.display(), e);
        drop(client);
        process::exit(1);
    }
}
