// The interactive operator shell. A thin collaborator: every command maps
// onto one Session query or action.

use std::sync::Arc;

use anyhow::Context;
use libshoal::Session;
use shoal_core::clock::now_ms;
use size_format::SizeFormatterBinary as SF;
use tokio::io::AsyncBufReadExt;

const HELP: &str = "\
commands:
  list                 local files and their chunk availability (alias: ls)
  peers                peers known from the tracker
  download <file>      fetch a file from the swarm (alias: dl, get)
  downloads            download tasks and their progress
  status               session overview
  refresh              force a tracker announce now
  tracker              tracker connection details
  whoami               this peer's identity
  help                 this text (alias: ?)
  quit                 say goodbye and exit (alias: q, exit)
";

fn prompt() {
    use std::io::Write;
    print!("shoal> ");
    let _ = std::io::stdout().flush();
}

pub async fn run(session: Arc<Session>) -> anyhow::Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    println!("type 'help' for commands");
    prompt();
    while let Some(line) = lines.next_line().await.context("error reading stdin")? {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let arg = parts.next();
        match (command, arg) {
            ("", _) => {}
            ("list" | "ls", _) => cmd_list(&session),
            ("peers", _) => cmd_peers(&session),
            ("download" | "dl" | "get", Some(file)) => cmd_download(&session, file),
            ("download" | "dl" | "get", None) => println!("usage: download <file>"),
            ("downloads", _) => cmd_downloads(&session),
            ("status", _) => cmd_status(&session),
            ("refresh", _) => {
                session.refresh();
                println!("tracker update queued");
            }
            ("tracker", _) => cmd_tracker(&session),
            ("whoami", _) => println!("{}", session.peer_id()),
            ("help" | "?", _) => print!("{HELP}"),
            ("quit" | "q" | "exit", _) => break,
            (other, _) => println!("unknown command {other:?}, try 'help'"),
        }
        prompt();
    }
    Ok(())
}

fn cmd_list(session: &Arc<Session>) {
    let files = session.local_files();
    if files.is_empty() {
        println!("no local files");
        return;
    }
    for file in files {
        match file.metadata {
            Some(meta) => {
                let state = if file.available.len() as u32 == meta.total_chunks {
                    "complete"
                } else {
                    "partial"
                };
                println!(
                    "  {}  {}B  {}/{} chunks  {state}",
                    file.file_name,
                    SF::new(meta.file_size),
                    file.available.len(),
                    meta.total_chunks,
                );
            }
            None => println!(
                "  {}  {} chunks, metadata pending",
                file.file_name,
                file.available.len()
            ),
        }
    }
}

fn cmd_peers(session: &Arc<Session>) {
    let peers = session.known_peers();
    if peers.is_empty() {
        println!("no peers known");
        return;
    }
    for peer in peers {
        let chunks: usize = peer.files.values().map(|s| s.len()).sum();
        println!(
            "  {}  {} files, {chunks} chunks advertised",
            peer.peer_id,
            peer.files.len(),
        );
        for (file, set) in &peer.files {
            println!("      {file}: {} chunks", set.len());
        }
    }
}

fn cmd_download(session: &Arc<Session>, file: &str) {
    match session.download(file) {
        Ok(mut rx) => {
            println!("download of {file:?} started");
            let file = file.to_string();
            tokio::spawn(async move {
                match rx.wait_for(|s| s.is_terminal()).await {
                    Ok(status) => println!("\ndownload of {file:?} finished: {:?}", *status),
                    Err(_) => println!("\ndownload of {file:?} went away"),
                }
            });
        }
        Err(e) => println!("can't download {file:?}: {e:#}"),
    }
}

fn cmd_downloads(session: &Arc<Session>) {
    let downloads = session.downloads();
    if downloads.is_empty() {
        println!("no downloads");
        return;
    }
    for d in downloads {
        let done = d.total_chunks.saturating_sub(d.remaining);
        let percent = if d.total_chunks > 0 {
            done as u64 * 100 / d.total_chunks as u64
        } else {
            0
        };
        println!(
            "  {}  {done}/{} chunks ({percent}%)  {:?}",
            d.file_name, d.total_chunks, d.status
        );
    }
}

fn cmd_status(session: &Arc<Session>) {
    let totals = session.totals();
    let stats = session.server_stats();
    println!("peer      {}", session.peer_id());
    println!("tcp       {}", session.tcp_addr());
    println!(
        "tracker   {} ({})",
        session.tracker_addr(),
        if session.is_connected() {
            "connected"
        } else {
            "disconnected"
        }
    );
    println!(
        "store     {} files, {} chunks, {}B",
        totals.files,
        totals.chunks,
        SF::new(totals.bytes)
    );
    println!(
        "server    {} active, {} requests, {} transfers",
        stats.active_connections, stats.total_requests, stats.successful_transfers
    );
    println!("downloads {}", session.downloads().len());
}

fn cmd_tracker(session: &Arc<Session>) {
    println!("tracker   {}", session.tracker_addr());
    let last = session.last_tracker_response_ms();
    if last == 0 {
        println!("last seen never");
    } else {
        println!("last seen {}s ago", now_ms().saturating_sub(last) / 1000);
    }
    println!(
        "status    {}",
        if session.is_connected() {
            "connected"
        } else {
            "disconnected"
        }
    );
}
