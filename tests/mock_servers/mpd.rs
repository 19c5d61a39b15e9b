#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]
//! Mock MPD for testing
//!
//! Speaks the line protocol: greeting, quoted arguments, `OK`/`ACK`
//! terminators, command lists and `idle`/`noidle`. State changes made by
//! commands (or pushed by the test) are reported to idling connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// Mock MPD state
#[derive(Debug, Clone)]
pub struct MockMpdState {
    pub version: String,
    pub password: Option<String>,
    pub state: String,
    pub current: i64,
    pub volume: u32,
    pub repeat: bool,
    pub random: bool,
    pub single: String,
    pub consume: bool,
    pub updating: bool,
    /// Songs as ordered tag pairs; the first pair is `file`.
    pub library: Vec<Vec<(String, String)>>,
    pub queue: Vec<String>,
    pub outputs: Vec<(String, bool)>,
    /// Commands received (name plus unquoted args), idle/noidle excluded
    pub commands: Vec<String>,
    /// Command name → ACK (code, message)
    pub failures: HashMap<String, (u32, String)>,
}

impl Default for MockMpdState {
    fn default() -> Self {
        Self {
            version: "0.23.5".to_string(),
            password: None,
            state: "stop".to_string(),
            current: -1,
            volume: 50,
            repeat: false,
            random: false,
            single: "0".to_string(),
            consume: false,
            updating: false,
            library: Vec::new(),
            queue: Vec::new(),
            outputs: vec![("Speakers".to_string(), true)],
            commands: Vec::new(),
            failures: HashMap::new(),
        }
    }
}

/// Mock MPD server
pub struct MockMpdServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockMpdState>>,
    events: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
    accepted: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockMpdServer {
    /// Start a mock MPD server on a random port
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0").await
    }

    /// Start a mock MPD server on a fixed address
    pub async fn start_on(addr: &str) -> Self {
        let state = Arc::new(RwLock::new(MockMpdState::default()));
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events, _) = broadcast::channel(64);
        let (kill, _) = broadcast::channel(4);
        let accepted = Arc::new(AtomicUsize::new(0));

        let conn = Shared {
            state: state.clone(),
            events: events.clone(),
            kill: kill.clone(),
        };
        let counter = accepted.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let conn = conn.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, conn).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            addr,
            state,
            events,
            kill,
            accepted,
            handle,
        }
    }

    /// `host:port` for dialing
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub async fn set_version(&self, version: &str) {
        self.state.write().await.version = version.to_string();
    }

    pub async fn set_password(&self, password: &str) {
        self.state.write().await.password = Some(password.to_string());
    }

    /// Library of bare files
    pub async fn set_library(&self, files: &[&str]) {
        self.state.write().await.library = files
            .iter()
            .map(|f| vec![("file".to_string(), f.to_string())])
            .collect();
    }

    /// Library with tags: `(file, [(tag, value)])`
    pub async fn set_tagged_library(&self, songs: &[(&str, &[(&str, &str)])]) {
        self.state.write().await.library = songs
            .iter()
            .map(|(file, tags)| {
                let mut song = vec![("file".to_string(), file.to_string())];
                song.extend(tags.iter().map(|(k, v)| (k.to_string(), v.to_string())));
                song
            })
            .collect();
    }

    pub async fn set_queue(&self, files: &[&str]) {
        self.state.write().await.queue = files.iter().map(|f| f.to_string()).collect();
    }

    pub async fn queue(&self) -> Vec<String> {
        self.state.read().await.queue.clone()
    }

    pub async fn commands(&self) -> Vec<String> {
        self.state.read().await.commands.clone()
    }

    pub async fn clear_commands(&self) {
        self.state.write().await.commands.clear();
    }

    /// Make every `command` answer with an ACK
    pub async fn fail(&self, command: &str, code: u32, message: &str) {
        self.state
            .write()
            .await
            .failures
            .insert(command.to_string(), (code, message.to_string()));
    }

    /// Report a subsystem change to idling connections
    pub fn push_event(&self, subsystem: &str) {
        let _ = self.events.send(subsystem.to_string());
    }

    /// Drop every open connection; the listener keeps accepting
    pub fn disconnect_all(&self) {
        let _ = self.kill.send(());
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.kill.send(());
    }
}

#[derive(Clone)]
struct Shared {
    state: Arc<RwLock<MockMpdState>>,
    events: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
}

enum Reply {
    Ok(String),
    Ack(u32, String),
}

/// Handle a single TCP connection
async fn handle_connection(stream: TcpStream, shared: Shared) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut events = shared.events.subscribe();
    let mut kill = shared.kill.subscribe();

    let greeting = format!("OK MPD {}\n", shared.state.read().await.version);
    if writer.write_all(greeting.as_bytes()).await.is_err() {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = kill.recv() => break,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let tokens = tokenize(line.trim_end());
        let Some(name) = tokens.first().cloned() else {
            continue;
        };

        let response = match name.as_str() {
            "close" => break,
            "idle" => {
                let mut changed: Vec<String> = Vec::new();
                // Already-pending changes return at once.
                while let Ok(subsystem) = events.try_recv() {
                    push_unique(&mut changed, subsystem);
                }
                if changed.is_empty() {
                    line.clear();
                    tokio::select! {
                        _ = kill.recv() => break,
                        event = events.recv() => {
                            if let Ok(subsystem) = event {
                                push_unique(&mut changed, subsystem);
                            }
                            while let Ok(subsystem) = events.try_recv() {
                                push_unique(&mut changed, subsystem);
                            }
                        }
                        read = reader.read_line(&mut line) => {
                            match read {
                                Ok(0) | Err(_) => break,
                                Ok(_) => {}
                            }
                            // Only noidle may interrupt a pending idle.
                            if line.trim_end() != "noidle" {
                                break;
                            }
                        }
                    }
                }
                let mut out = String::new();
                for subsystem in changed {
                    out.push_str(&format!("changed: {}\n", subsystem));
                }
                out.push_str("OK\n");
                out
            }
            "noidle" => String::new(),
            "command_list_ok_begin" | "command_list_begin" => {
                let ok_mode = name == "command_list_ok_begin";
                let mut batch = Vec::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    let tokens = tokenize(line.trim_end());
                    if tokens.first().map(String::as_str) == Some("command_list_end") {
                        break;
                    }
                    batch.push(tokens);
                }
                let mut out = String::new();
                let mut failed = false;
                for (index, tokens) in batch.iter().enumerate() {
                    match execute(tokens, &shared).await {
                        Reply::Ok(body) => {
                            out.push_str(&body);
                            if ok_mode {
                                out.push_str("list_OK\n");
                            }
                        }
                        Reply::Ack(code, message) => {
                            out.push_str(&format!(
                                "ACK [{}@{}] {{{}}} {}\n",
                                code, index, tokens[0], message
                            ));
                            failed = true;
                            break;
                        }
                    }
                }
                if !failed {
                    out.push_str("OK\n");
                }
                out
            }
            _ => match execute(&tokens, &shared).await {
                Reply::Ok(body) => format!("{}OK\n", body),
                Reply::Ack(code, message) => format!("ACK [{}@0] {{{}}} {}\n", code, name, message),
            },
        };

        if !response.is_empty() && writer.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// Split a command line into name and unquoted arguments.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c == ' ' {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => token.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    tokens
}

async fn execute(tokens: &[String], shared: &Shared) -> Reply {
    let name = tokens[0].as_str();
    let arg = |i: usize| tokens.get(i).cloned().unwrap_or_default();
    let mut state = shared.state.write().await;

    if name != "password" {
        state.commands.push(tokens.join(" "));
    }
    if let Some((code, message)) = state.failures.get(name).cloned() {
        return Reply::Ack(code, message);
    }

    let mut changed: Vec<&str> = Vec::new();
    let reply = match name {
        "ping" => Reply::Ok(String::new()),
        "password" => match &state.password {
            Some(p) if *p == arg(1) => Reply::Ok(String::new()),
            _ => Reply::Ack(3, "incorrect password".to_string()),
        },
        "status" => {
            let mut out = format!(
                "volume: {}\nrepeat: {}\nrandom: {}\nsingle: {}\nconsume: {}\nplaylistlength: {}\nxfade: 0\nstate: {}\n",
                state.volume,
                state.repeat as u8,
                state.random as u8,
                state.single,
                state.consume as u8,
                state.queue.len(),
                state.state
            );
            if state.current >= 0 {
                out.push_str(&format!(
                    "song: {}\nelapsed: 1.000\nduration: 180.000\n",
                    state.current
                ));
            }
            if state.updating {
                out.push_str("updating_db: 1\n");
            }
            Reply::Ok(out)
        }
        "replay_gain_status" => Reply::Ok("replay_gain_mode: off\n".to_string()),
        "currentsong" => {
            let out = usize::try_from(state.current)
                .ok()
                .and_then(|i| state.queue.get(i).map(|f| format!("file: {}\nPos: {}\n", f, i)))
                .unwrap_or_default();
            Reply::Ok(out)
        }
        "playlistinfo" => {
            let mut out = String::new();
            for (i, file) in state.queue.iter().enumerate() {
                out.push_str(&format!("file: {}\nPos: {}\nId: {}\n", file, i, i + 1));
            }
            Reply::Ok(out)
        }
        "listallinfo" => {
            let mut out = String::from("directory: music\n");
            for song in &state.library {
                for (k, v) in song {
                    out.push_str(&format!("{}: {}\n", k, v));
                }
            }
            out.push_str("playlist: saved.m3u\n");
            Reply::Ok(out)
        }
        "stats" => Reply::Ok(format!(
            "artists: 1\nalbums: 1\nsongs: {}\nuptime: 100\nplaytime: 0\ndb_playtime: 0\ndb_update: 0\n",
            state.library.len()
        )),
        "outputs" => {
            let mut out = String::new();
            for (i, (name, enabled)) in state.outputs.iter().enumerate() {
                out.push_str(&format!(
                    "outputid: {}\noutputname: {}\nplugin: alsa\noutputenabled: {}\n",
                    i, name, *enabled as u8
                ));
            }
            Reply::Ok(out)
        }
        "enableoutput" | "disableoutput" => {
            let enabled = name == "enableoutput";
            match arg(1).parse::<usize>().ok().and_then(|i| state.outputs.get_mut(i)) {
                Some(output) => {
                    output.1 = enabled;
                    changed.push("output");
                    Reply::Ok(String::new())
                }
                None => Reply::Ack(50, "No such audio output".to_string()),
            }
        }
        "clear" => {
            state.queue.clear();
            state.current = -1;
            state.state = "stop".to_string();
            changed.push("playlist");
            Reply::Ok(String::new())
        }
        "add" => {
            let file = arg(1);
            if state.library.iter().any(|s| s[0].1 == file) {
                state.queue.push(file);
                changed.push("playlist");
                Reply::Ok(String::new())
            } else {
                Reply::Ack(50, "No such directory".to_string())
            }
        }
        "play" => {
            if let Ok(pos) = arg(1).parse::<i64>() {
                state.current = pos;
            }
            state.state = "play".to_string();
            changed.push("player");
            Reply::Ok(String::new())
        }
        "pause" => {
            state.state = "pause".to_string();
            changed.push("player");
            Reply::Ok(String::new())
        }
        "next" | "previous" | "seekcur" => {
            changed.push("player");
            Reply::Ok(String::new())
        }
        "setvol" => match arg(1).parse::<u32>() {
            Ok(v) if v <= 100 => {
                state.volume = v;
                changed.push("mixer");
                Reply::Ok(String::new())
            }
            _ => Reply::Ack(2, "Invalid volume value".to_string()),
        },
        "repeat" | "random" | "consume" => {
            let on = arg(1) == "1";
            match name {
                "repeat" => state.repeat = on,
                "random" => state.random = on,
                _ => state.consume = on,
            }
            changed.push("options");
            Reply::Ok(String::new())
        }
        "single" => {
            state.single = arg(1);
            changed.push("options");
            Reply::Ok(String::new())
        }
        "crossfade" | "replay_gain_mode" => {
            changed.push("options");
            Reply::Ok(String::new())
        }
        "update" => {
            state.updating = true;
            changed.push("update");
            Reply::Ok("updating_db: 1\n".to_string())
        }
        other => Reply::Ack(5, format!("unknown command \"{}\"", other)),
    };
    drop(state);

    for subsystem in changed {
        let _ = shared.events.send(subsystem.to_string());
    }
    reply
}
