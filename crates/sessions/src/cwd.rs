//! Working directory tracking from OSC 7 escape sequences.
//!
//! Shells configured for it report their directory as
//! `ESC ] 7 ; file://host/path` terminated by BEL or `ESC \`. The scanner
//! keeps state between chunks because a sequence may be split across reads.

/// Longest OSC payload we keep; longer ones are dropped.
const MAX_OSC_LEN: usize = 4096;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Ground,
    Escape,
    Osc,
    OscEscape,
}

/// Incremental OSC 7 scanner.
#[derive(Debug, Default)]
pub struct CwdTracker {
    state: State,
    payload: Vec<u8>,
    overflow: bool,
}

impl CwdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans a chunk of output; returns the last directory reported in it.
    pub fn feed(&mut self, data: &[u8]) -> Option<String> {
        let mut found = None;
        for &byte in data {
            match self.state {
                State::Ground => {
                    if byte == ESC {
                        self.state = State::Escape;
                    }
                }
                State::Escape => {
                    if byte == b']' {
                        self.state = State::Osc;
                        self.payload.clear();
                        self.overflow = false;
                    } else if byte != ESC {
                        self.state = State::Ground;
                    }
                }
                State::Osc => match byte {
                    BEL => {
                        if let Some(path) = self.finish() {
                            found = Some(path);
                        }
                    }
                    ESC => self.state = State::OscEscape,
                    _ => self.push(byte),
                },
                State::OscEscape => {
                    if byte == b'\\' {
                        if let Some(path) = self.finish() {
                            found = Some(path);
                        }
                    } else {
                        // Unterminated; treat the ESC as the start of a new sequence.
                        self.payload.clear();
                        self.state = if byte == b']' {
                            State::Osc
                        } else {
                            State::Ground
                        };
                        self.overflow = false;
                    }
                }
            }
        }
        found
    }

    fn push(&mut self, byte: u8) {
        if self.payload.len() < MAX_OSC_LEN {
            self.payload.push(byte);
        } else {
            self.overflow = true;
        }
    }

    fn finish(&mut self) -> Option<String> {
        self.state = State::Ground;
        let payload = std::mem::take(&mut self.payload);
        if self.overflow {
            return None;
        }
        let rest = payload.strip_prefix(b"7;")?;
        parse_file_url(std::str::from_utf8(rest).ok()?)
    }
}

/// Extracts the decoded path from `file://host/path`.
fn parse_file_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("file://")?;
    let path = &rest[rest.find('/')?..];
    percent_decode(path)
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
