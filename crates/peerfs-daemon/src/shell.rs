//! Interactive shell over a connected client
//!
//! A small line-oriented loop: list, navigate, read, and move files on
//! the remote side. Errors print a single line and the prompt returns.

use std::io::Write as _;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, BufReader};

use peerfs_core::{FsError, READ_DIR_WINDOW};

use crate::client::FsClient;

/// Join `arg` onto `cwd` and clean the result; `..` navigates up on the
/// client side so the server never sees parent components.
pub fn resolve_path(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), arg)
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

async fn list(client: &FsClient, path: &str) -> Result<(), FsError> {
    let mut dir = client.open(path);
    loop {
        let entries = dir.read_dir(READ_DIR_WINDOW).await?;
        for entry in &entries {
            let marker = if entry.is_dir() { "d" } else { "-" };
            println!("{}\t{}\t{}\t{}", marker, entry.size, entry.kind, entry.name);
        }
        if entries.len() < READ_DIR_WINDOW {
            return Ok(());
        }
    }
}

async fn run_command(client: &FsClient, cwd: &mut String, line: &str) -> Result<bool, FsError> {
    let mut parts = line.split_whitespace();
    let cmd = match parts.next() {
        Some(cmd) => cmd,
        None => return Ok(true),
    };
    let arg = parts.next().unwrap_or("");
    let arg2 = parts.next().unwrap_or("");

    match cmd {
        "exit" | "quit" => return Ok(false),
        "help" => {
            println!("commands: ls cd pwd cat get put rm mkdir mv help exit");
        }
        "pwd" => println!("{}", cwd),
        "cd" => {
            let target = resolve_path(cwd, arg);
            let entry = client.stat(&target).await?;
            if !entry.is_dir() {
                return Err(FsError::Invalid.with_context("cd", &target));
            }
            *cwd = target;
        }
        "ls" => list(client, &resolve_path(cwd, arg)).await?,
        "cat" => {
            let data = client.read_file(&resolve_path(cwd, arg)).await?;
            std::io::stdout().write_all(&data).map_err(FsError::from)?;
        }
        "get" | "pull" => {
            let remote = resolve_path(cwd, arg);
            let data = client.read_file(&remote).await?;
            let local = Path::new(&remote).file_name().and_then(|n| n.to_str()).unwrap_or("out");
            std::fs::write(local, data).map_err(FsError::from)?;
            println!("saved {}", local);
        }
        "put" | "push" => {
            let data = std::fs::read(arg).map_err(FsError::from)?;
            let name = Path::new(arg).file_name().and_then(|n| n.to_str()).unwrap_or(arg);
            let remote = if arg2.is_empty() {
                resolve_path(cwd, name)
            } else {
                resolve_path(cwd, arg2)
            };
            client.write_file(&remote, &data).await?;
            println!("wrote {}", remote);
        }
        "rm" => client.remove(&resolve_path(cwd, arg)).await?,
        "mkdir" => client.mkdir(&resolve_path(cwd, arg)).await?,
        "mv" => {
            client.rename(&resolve_path(cwd, arg), &resolve_path(cwd, arg2)).await?;
        }
        other => println!("unknown command: {} (try help)", other),
    }
    Ok(true)
}

/// Read-eval loop on stdin until `exit` or end of input.
pub async fn run_shell(client: FsClient) -> Result<(), FsError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut cwd = "/".to_string();
    loop {
        print!("{}> ", cwd);
        std::io::stdout().flush().map_err(FsError::from)?;
        let line = match lines.next_line().await.map_err(FsError::from)? {
            Some(line) => line,
            None => return Ok(()),
        };
        match run_command(&client, &mut cwd, &line).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => eprintln!("{}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_cleans_components() {
        assert_eq!(resolve_path("/", "docs"), "/docs");
        assert_eq!(resolve_path("/docs", "a.txt"), "/docs/a.txt");
        assert_eq!(resolve_path("/docs", "/top.txt"), "/top.txt");
        assert_eq!(resolve_path("/docs/sub", ".."), "/docs");
        assert_eq!(resolve_path("/docs", "../../.."), "/");
        assert_eq!(resolve_path("/", "./a//b"), "/a/b");
    }
}
