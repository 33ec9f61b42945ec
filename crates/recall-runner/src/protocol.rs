//! Client side of the stimulation server link: newline-delimited JSON
//! envelopes `{"type", "data", "id", "time"}` over any byte stream.
//!
//! Every envelope sent or received is appended to the session's
//! `communications.csv`. Message ids and the heartbeat counter live in a
//! [`SessionContext`] owned by the caller.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, RunnerError};

pub const COMMUNICATIONS_FIELDS: [&str; 4] = ["type", "time", "data", "id"];
pub const DEFAULT_HEARTBEATS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StimMode {
    None,
    Open,
    Closed,
}

/// One variant per message kind; each carries only the fields its kind
/// sends as `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "UPPERCASE")]
pub enum Message {
    Connected {},
    Configure {
        stim_mode: StimMode,
        experiment: String,
        subject: String,
        tags: Vec<String>,
    },
    Ready {},
    Heartbeat {
        count: u64,
    },
    Session {
        session: u32,
    },
    Instruct {},
    Orient {},
    Word {
        word: String,
        serialpos: u32,
        stim: bool,
    },
    Trial {
        trial: u32,
        stim: bool,
    },
    TrialEnd {},
    Math {
        problem: String,
        response: String,
        response_time_ms: u64,
        correct: bool,
    },
    Distract {},
    Countdown {},
    Recall {
        duration: u64,
    },
    Rest {},
    Stim {},
    StimSelect {
        stimtag: String,
    },
    ClStim {
        classifyms: u64,
    },
    ClSham {
        classifyms: u64,
    },
    ClNormalize {
        classifyms: u64,
    },
    CclStartStim {
        duration_s: f64,
    },
    Exit {},
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connected {} => "CONNECTED",
            Message::Configure { .. } => "CONFIGURE",
            Message::Ready {} => "READY",
            Message::Heartbeat { .. } => "HEARTBEAT",
            Message::Session { .. } => "SESSION",
            Message::Instruct {} => "INSTRUCT",
            Message::Orient {} => "ORIENT",
            Message::Word { .. } => "WORD",
            Message::Trial { .. } => "TRIAL",
            Message::TrialEnd {} => "TRIALEND",
            Message::Math { .. } => "MATH",
            Message::Distract {} => "DISTRACT",
            Message::Countdown {} => "COUNTDOWN",
            Message::Recall { .. } => "RECALL",
            Message::Rest {} => "REST",
            Message::Stim {} => "STIM",
            Message::StimSelect { .. } => "STIMSELECT",
            Message::ClStim { .. } => "CLSTIM",
            Message::ClSham { .. } => "CLSHAM",
            Message::ClNormalize { .. } => "CLNORMALIZE",
            Message::CclStartStim { .. } => "CCLSTARTSTIM",
            Message::Exit {} => "EXIT",
        }
    }

    /// The server acknowledges these kinds with `<KIND>_OK`.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Message::Connected {}
                | Message::Configure { .. }
                | Message::Ready {}
                | Message::Heartbeat { .. }
        )
    }
}

/// A message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub id: u64,
    #[serde(default)]
    pub time: Value,
}

/// Message id and heartbeat counters for one connection.
#[derive(Debug, Clone)]
pub struct SessionContext {
    message_id: u64,
    heartbeat_count: u64,
    started: Instant,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            message_id: 0,
            heartbeat_count: 0,
            started: Instant::now(),
        }
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeat_count
    }

    pub fn next_heartbeat(&mut self) -> Message {
        self.heartbeat_count += 1;
        Message::Heartbeat {
            count: self.heartbeat_count,
        }
    }

    /// Stamp `message` with the next id and the milliseconds elapsed since
    /// the context was created.
    pub fn seal(&mut self, message: &Message) -> Result<Envelope> {
        self.message_id += 1;
        let value = serde_json::to_value(message)?;
        let data = value.get("data").cloned().unwrap_or_else(|| Value::Object(Default::default()));
        let elapsed = self.started.elapsed().as_millis() as u64;
        Ok(Envelope {
            kind: message.kind().to_string(),
            data,
            id: self.message_id,
            time: Value::from(elapsed),
        })
    }
}

/// `communications.csv`, written in `type, time, data, id` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicationsLog {
    path: PathBuf,
}

impl CommunicationsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, envelope: &Envelope) -> Result<()> {
        let fresh = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::Writer::from_writer(file);
        if fresh {
            writer.write_record(COMMUNICATIONS_FIELDS)?;
        }
        let time = match &envelope.time {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let data = serde_json::to_string(&envelope.data)?;
        let id = envelope.id.to_string();
        writer.write_record([envelope.kind.as_str(), time.as_str(), data.as_str(), id.as_str()])?;
        writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOptions {
    pub heartbeats: usize,
    pub heartbeat_interval: Duration,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            heartbeats: DEFAULT_HEARTBEATS,
            heartbeat_interval: Duration::from_millis(100),
        }
    }
}

pub struct StimulationLink<S: Read + Write> {
    stream: BufReader<S>,
    log: CommunicationsLog,
}

impl<S: Read + Write> StimulationLink<S> {
    pub fn new(stream: S, log: CommunicationsLog) -> Self {
        Self {
            stream: BufReader::new(stream),
            log,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Send one message; for acknowledged kinds, wait for the matching
    /// `<KIND>_OK` and return it.
    pub fn send(&mut self, ctx: &mut SessionContext, message: &Message) -> Result<Option<Envelope>> {
        let envelope = ctx.seal(message)?;
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        let stream = self.stream.get_mut();
        stream.write_all(&line)?;
        stream.flush()?;
        self.log.append(&envelope)?;
        debug!(kind = %envelope.kind, id = envelope.id, "sent server message");
        if !message.expects_reply() {
            return Ok(None);
        }

        let reply = self.receive()?;
        let expected = format!("{}_OK", envelope.kind);
        if reply.kind != expected || reply.id != envelope.id {
            return Err(RunnerError::Protocol(format!(
                "expected {} for id {}, got {} for id {}",
                expected, envelope.id, reply.kind, reply.id
            )));
        }
        Ok(Some(reply))
    }

    fn receive(&mut self) -> Result<Envelope> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.stream.read_line(&mut line)? == 0 {
                return Err(RunnerError::Protocol(
                    "stimulation server closed the connection".to_string(),
                ));
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        let reply: Envelope = serde_json::from_str(line.trim())
            .map_err(|e| RunnerError::Protocol(format!("malformed server reply: {}", e)))?;
        self.log.append(&reply)?;
        debug!(kind = %reply.kind, id = reply.id, "received server reply");
        Ok(reply)
    }

    fn heartbeats(&mut self, ctx: &mut SessionContext, options: &HandshakeOptions) -> Result<()> {
        for i in 0..options.heartbeats {
            let heartbeat = ctx.next_heartbeat();
            self.send(ctx, &heartbeat)?;
            if i + 1 < options.heartbeats && !options.heartbeat_interval.is_zero() {
                std::thread::sleep(options.heartbeat_interval);
            }
        }
        Ok(())
    }

    /// CONNECTED, CONFIGURE and READY, then a run of heartbeats.
    pub fn open(
        &mut self,
        ctx: &mut SessionContext,
        configure: Message,
        options: &HandshakeOptions,
    ) -> Result<()> {
        if !matches!(configure, Message::Configure { .. }) {
            return Err(RunnerError::Protocol(format!(
                "opening handshake needs a CONFIGURE message, got {}",
                configure.kind()
            )));
        }
        self.send(ctx, &Message::Connected {})?;
        self.send(ctx, &configure)?;
        self.send(ctx, &Message::Ready {})?;
        self.heartbeats(ctx, options)?;
        info!(
            messages = ctx.message_id(),
            heartbeats = ctx.heartbeat_count(),
            "stimulation server handshake complete"
        );
        Ok(())
    }

    /// A run of heartbeats, then EXIT. The server does not answer EXIT.
    pub fn close(&mut self, ctx: &mut SessionContext, options: &HandshakeOptions) -> Result<()> {
        self.heartbeats(ctx, options)?;
        self.send(ctx, &Message::Exit {})?;
        info!(messages = ctx.message_id(), "stimulation server connection closed");
        Ok(())
    }
}
