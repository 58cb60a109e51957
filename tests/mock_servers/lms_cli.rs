#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock LMS command-line interface for testing
//!
//! Simulates the line protocol on port 9090: login (dropping the socket on
//! bad credentials), the capability probes, `listen`, `exit`, paged catalog
//! queries with tagged records, and pushed event lines.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// How the mock misbehaves, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Read everything, answer nothing.
    Silent,
    /// Drop the socket when this probe arrives.
    DropOn(&'static str),
}

/// Mock server state
#[derive(Debug, Clone)]
pub struct MockCliState {
    pub credentials: Option<(String, String)>,
    pub can_music_folders: bool,
    pub can_random_play: bool,
    pub http_port: u16,
    pub album_sort: String,
    pub version: String,
    pub artists: Vec<(String, String)>,
    pub players: Vec<(String, String)>,
    /// Queue of the first player: (track id, title).
    pub queue: Vec<(String, String)>,
    pub fault: Fault,
    /// Every decoded line received, in order.
    pub received: Vec<String>,
}

impl Default for MockCliState {
    fn default() -> Self {
        Self {
            credentials: None,
            can_music_folders: true,
            can_random_play: false,
            http_port: 9000,
            album_sort: "artistalbum".to_string(),
            version: "8.5.2".to_string(),
            artists: (0..120)
                .map(|i| (format!("{}", 1000 + i), format!("Artist {:03}", i)))
                .collect(),
            players: vec![("00:04:20:aa:bb:cc".to_string(), "Kitchen".to_string())],
            queue: (0..5)
                .map(|i| (format!("{}", 500 + i), format!("Track {}", i)))
                .collect(),
            fault: Fault::None,
            received: Vec::new(),
        }
    }
}

/// Mock CLI server
pub struct MockCliServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockCliState>>,
    pushes: broadcast::Sender<String>,
    handle: JoinHandle<()>,
}

impl MockCliServer {
    /// Start a mock server on a random port
    pub async fn start() -> Self {
        Self::start_with(MockCliState::default()).await
    }

    pub async fn start_with(initial: MockCliState) -> Self {
        let state = Arc::new(RwLock::new(initial));
        let (pushes, _) = broadcast::channel(64);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state_clone = state.clone();
        let pushes_clone = pushes.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = state_clone.clone();
                let pushes = pushes_clone.subscribe();
                tokio::spawn(async move {
                    handle_connection(stream, state, pushes).await;
                });
            }
        });

        Self {
            addr,
            state,
            pushes,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Lines received so far (decoded).
    pub async fn received(&self) -> Vec<String> {
        self.state.read().await.received.clone()
    }

    /// Keep only the first `keep` artists, as after a library rescan.
    pub async fn truncate_artists(&self, keep: usize) {
        self.state.write().await.artists.truncate(keep);
    }

    /// Push an event line to every connection that enabled `listen 1`.
    pub fn push(&self, tokens: &[&str]) {
        if self.pushes.send(encode(tokens)).is_err() {
            panic!("no connection is listening for pushes");
        }
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.handle.abort();
    }
}

fn encode<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| urlencoding::encode(t.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode(line: &str) -> Vec<String> {
    line.split_whitespace()
        .map(|t| {
            urlencoding::decode(t)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| t.to_string())
        })
        .collect()
}

enum Outcome {
    Reply(String),
    Silence,
    Close,
    CloseAfter(String),
}

/// Handle a single TCP connection
async fn handle_connection(
    stream: TcpStream,
    state: Arc<RwLock<MockCliState>>,
    mut pushes: broadcast::Receiver<String>,
) {
    let (reader, mut writer) = stream.into_split();
    // next_line() is cancel-safe, so a push never loses half a request
    let mut lines = BufReader::new(reader).lines();
    let mut authenticated = state.read().await.credentials.is_none();
    let mut listening = false;

    loop {
        tokio::select! {
            read = lines.next_line() => {
                let line = match read {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };
                let tokens = decode(&line);
                if tokens.is_empty() {
                    continue;
                }
                let outcome = {
                    let mut state = state.write().await;
                    state.received.push(tokens.join(" "));
                    process_command(&tokens, &mut state, &mut authenticated, &mut listening)
                };
                match outcome {
                    Outcome::Reply(reply) => {
                        if writer.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Outcome::Silence => {}
                    Outcome::Close => break,
                    Outcome::CloseAfter(reply) => {
                        let _ = writer.write_all(format!("{}\n", reply).as_bytes()).await;
                        break;
                    }
                }
            }
            pushed = pushes.recv() => {
                match pushed {
                    Ok(event) if listening => {
                        if writer.write_all(format!("{}\n", event).as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn process_command(
    tokens: &[String],
    state: &mut MockCliState,
    authenticated: &mut bool,
    listening: &mut bool,
) -> Outcome {
    let words: Vec<&str> = tokens.iter().map(String::as_str).collect();

    match state.fault {
        Fault::Silent => return Outcome::Silence,
        Fault::DropOn(probe) if words.join(" ") == probe => return Outcome::Close,
        _ => {}
    }

    if !*authenticated {
        return match (&state.credentials, words.as_slice()) {
            (Some((user, pass)), ["login", u, p]) if *u == user.as_str() && *p == pass.as_str() => {
                *authenticated = true;
                Outcome::Reply(encode(&["login", *u, "******"]))
            }
            // Bad login or anything else first: drop without a reply.
            _ => Outcome::Close,
        };
    }

    let flag = |b: bool| if b { "1" } else { "0" };
    match words.as_slice() {
        ["login", u, _] => Outcome::Reply(encode(&["login", *u, "******"])),
        ["exit"] => Outcome::CloseAfter("exit".to_string()),
        ["listen", mode] => {
            *listening = *mode == "1";
            Outcome::Reply(encode(&["listen", *mode]))
        }
        ["can", "musicfolder", "?"] => {
            Outcome::Reply(encode(&["can", "musicfolder", flag(state.can_music_folders)]))
        }
        ["can", "randomplay", "?"] => {
            Outcome::Reply(encode(&["can", "randomplay", flag(state.can_random_play)]))
        }
        ["pref", "httpport", "?"] => {
            Outcome::Reply(encode(&["pref", "httpport", state.http_port.to_string().as_str()]))
        }
        ["pref", "jivealbumsort", "?"] => {
            Outcome::Reply(encode(&["pref", "jivealbumsort", state.album_sort.as_str()]))
        }
        ["version", "?"] => Outcome::Reply(encode(&["version", state.version.as_str()])),
        ["artists", start, count, ..] => {
            let (start, count) = (parse(start), parse(count));
            let mut reply: Vec<String> = tokens.to_vec();
            for (id, name) in state.artists.iter().skip(start).take(count) {
                reply.push(format!("id:{}", id));
                reply.push(format!("artist:{}", name));
            }
            reply.push(format!("count:{}", state.artists.len()));
            Outcome::Reply(encode(&reply))
        }
        ["players", start, count, ..] => {
            let (start, count) = (parse(start), parse(count));
            let mut reply: Vec<String> = tokens.to_vec();
            reply.push(format!("count:{}", state.players.len()));
            for (index, (id, name)) in state.players.iter().enumerate().skip(start).take(count) {
                reply.push(format!("playerindex:{}", index));
                reply.push(format!("playerid:{}", id));
                reply.push(format!("name:{}", name));
            }
            Outcome::Reply(encode(&reply))
        }
        [_player, "status", start, count, ..] => {
            let (start, count) = (parse(start), parse(count));
            let mut reply: Vec<String> = tokens.to_vec();
            reply.push("mode:stop".to_string());
            reply.push(format!("playlist_tracks:{}", state.queue.len()));
            for (index, (id, title)) in state.queue.iter().enumerate().skip(start).take(count) {
                reply.push(format!("playlist index:{}", index));
                reply.push(format!("id:{}", id));
                reply.push(format!("title:{}", title));
            }
            Outcome::Reply(encode(&reply))
        }
        [player, "playlist", "tracks", "?"] => {
            let len = state.queue.len().to_string();
            Outcome::Reply(encode(&[*player, "playlist", "tracks", len.as_str()]))
        }
        [_player, "playlistcontrol", "cmd:add", track] => {
            let id = track.trim_start_matches("track_id:").to_string();
            state.queue.push((id.clone(), format!("Track {}", id)));
            let mut reply: Vec<String> = tokens.to_vec();
            reply.push("count:1".to_string());
            Outcome::Reply(encode(&reply))
        }
        [_player, "playlist", "move", from, to] => {
            let (from, to) = (parse(from), parse(to));
            if from < state.queue.len() && to < state.queue.len() {
                let entry = state.queue.remove(from);
                state.queue.insert(to, entry);
            }
            Outcome::Reply(encode(tokens))
        }
        [_player, "playlist", "delete", index] => {
            let index = parse(index);
            if index < state.queue.len() {
                state.queue.remove(index);
            }
            Outcome::Reply(encode(tokens))
        }
        // Anything else is echoed back unchanged.
        _ => Outcome::Reply(encode(tokens)),
    }
}

fn parse(raw: &str) -> usize {
    raw.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_cli_answers_version_probe() {
        let server = MockCliServer::start().await;

        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        writer.write_all(b"version %3F\n").await.unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "version 8.5.2");
        assert_eq!(server.received().await, vec!["version ?"]);

        server.stop().await;
    }

    #[tokio::test]
    async fn mock_cli_drops_bad_login() {
        let server = MockCliServer::start_with(MockCliState {
            credentials: Some(("admin".into(), "secret".into())),
            ..MockCliState::default()
        })
        .await;

        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        writer.write_all(b"login admin wrong\n").await.unwrap();

        let mut line = String::new();
        assert_eq!(reader.read_line(&mut line).await.unwrap(), 0);

        server.stop().await;
    }
}
