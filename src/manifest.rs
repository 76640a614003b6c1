use chrono::NaiveDateTime;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::debug;

use crate::actions::Action;
use crate::error::ApplyError;
use crate::mbr::Partition;
use crate::sparse::SparseMap;
use crate::task::Requirement;

/// Format of the `meta-creation-date` global option.
const CREATION_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Parsed manifest (the `meta.conf` configuration tree).
#[derive(Debug, Default)]
pub struct Config {
    pub creation_date: Option<NaiveDateTime>,
    pub resources: Vec<Resource>,
    pub mbrs: Vec<MbrDef>,
    pub tasks: Vec<Task>,
}

impl Config {
    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn mbr(&self, name: &str) -> Option<&MbrDef> {
        self.mbrs.iter().find(|m| m.name == name)
    }
}

/// A `file-resource "<id>"` record.
#[derive(Debug)]
pub struct Resource {
    pub id: String,
    pub map: SparseMap,
    pub sha256: Option<[u8; 32]>,
}

/// An `mbr "<name>"` partition table definition.
#[derive(Debug)]
pub struct MbrDef {
    pub name: String,
    pub partitions: [Option<Partition>; 4],
}

/// A `task "<title>"` record, with its lifecycle events in manifest order.
#[derive(Debug)]
pub struct Task {
    pub title: String,
    /// Legacy constraint; negative means unused.
    pub require_partition1_offset: i64,
    pub requirements: Vec<Requirement>,
    pub on_init: Option<Event>,
    pub on_finish: Option<Event>,
    pub on_resource: Vec<Event>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Init,
    Resource,
    Finish,
}

/// One event section carrying an ordered action list.
#[derive(Debug)]
pub struct Event {
    /// Resource identifier for `on-resource` sections, `None` otherwise.
    pub resource: Option<String>,
    pub actions: Vec<Action>,
}

impl Task {
    /// Resolve the event section for `kind` (+ resource id for
    /// [`EventKind::Resource`]).
    pub fn event(&self, kind: EventKind, param: Option<&str>) -> Option<&Event> {
        match kind {
            EventKind::Init => self.on_init.as_ref(),
            EventKind::Finish => self.on_finish.as_ref(),
            EventKind::Resource => {
                let id = param?;
                self.on_resource
                    .iter()
                    .find(|e| e.resource.as_deref() == Some(id))
            }
        }
    }
}

/// Verify the manifest against its detached signature, then parse it.
///
/// With a public key present, a missing or mismatching signature is
/// [`ApplyError::SignatureVerify`]. Without a key, any signature is ignored.
pub fn parse_and_verify(
    manifest: &[u8],
    signature: Option<&[u8; 64]>,
    public_key: Option<&[u8; 32]>,
) -> Result<Config, ApplyError> {
    if let Some(key) = public_key {
        let sig = signature.ok_or(ApplyError::SignatureVerify)?;
        let key = VerifyingKey::from_bytes(key).map_err(|_| ApplyError::SignatureVerify)?;
        key.verify(manifest, &Signature::from_bytes(sig))
            .map_err(|_| ApplyError::SignatureVerify)?;
    }

    let text = std::str::from_utf8(manifest).map_err(|_| ApplyError::ManifestParse {
        line: 0,
        msg: "manifest is not valid UTF-8".into(),
    })?;
    parse_str(text)
}

fn perr(line: usize, msg: impl Into<String>) -> ApplyError {
    ApplyError::ManifestParse {
        line,
        msg: msg.into(),
    }
}

// ---- Lexer ----

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LBrace,
    RBrace,
    Eq,
    Comma,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn skip_blank(&mut self) {
        while let Some(&c) = self.src.get(self.pos) {
            match c {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'#' => {
                    while self.src.get(self.pos).is_some_and(|&c| c != b'\n') {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn next(&mut self) -> Result<Option<Token>, ApplyError> {
        self.skip_blank();
        let Some(&c) = self.src.get(self.pos) else {
            return Ok(None);
        };
        let tok = match c {
            b'{' => {
                self.pos += 1;
                Token::LBrace
            }
            b'}' => {
                self.pos += 1;
                Token::RBrace
            }
            b'=' => {
                self.pos += 1;
                Token::Eq
            }
            b',' => {
                self.pos += 1;
                Token::Comma
            }
            b'"' => {
                self.pos += 1;
                let mut s = String::new();
                loop {
                    match self.src.get(self.pos) {
                        None | Some(b'\n') => {
                            return Err(perr(self.line, "unterminated string"));
                        }
                        Some(b'"') => {
                            self.pos += 1;
                            break;
                        }
                        Some(b'\\') => {
                            self.pos += 1;
                            match self.src.get(self.pos) {
                                Some(&e @ (b'"' | b'\\')) => {
                                    s.push(e as char);
                                    self.pos += 1;
                                }
                                _ => return Err(perr(self.line, "bad string escape")),
                            }
                        }
                        Some(&b) => {
                            s.push(b as char);
                            self.pos += 1;
                        }
                    }
                }
                Token::Str(s)
            }
            b'-' | b'0'..=b'9' => {
                let start = self.pos;
                if c == b'-' {
                    self.pos += 1;
                }
                while self
                    .src
                    .get(self.pos)
                    .is_some_and(|c| c.is_ascii_alphanumeric())
                {
                    self.pos += 1;
                }
                let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
                let value = if let Some(hex) = text
                    .strip_prefix("0x")
                    .or_else(|| text.strip_prefix("0X"))
                {
                    i64::from_str_radix(hex, 16)
                } else {
                    text.parse()
                };
                Token::Int(
                    value.map_err(|_| perr(self.line, format!("bad number '{text}'")))?,
                )
            }
            c if c.is_ascii_alphabetic() => {
                let start = self.pos;
                while self
                    .src
                    .get(self.pos)
                    .is_some_and(|&c| c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'.'))
                {
                    self.pos += 1;
                }
                Token::Ident(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
            }
            c => {
                return Err(perr(self.line, format!("unexpected character '{}'", c as char)));
            }
        };
        Ok(Some(tok))
    }
}

// ---- Parser ----

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<Option<Token>>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            lexer: Lexer::new(src),
            peeked: None,
        }
    }

    fn line(&self) -> usize {
        self.lexer.line
    }

    fn next(&mut self) -> Result<Option<Token>, ApplyError> {
        match self.peeked.take() {
            Some(tok) => Ok(tok),
            None => self.lexer.next(),
        }
    }

    fn peek(&mut self) -> Result<Option<&Token>, ApplyError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lexer.next()?);
        }
        Ok(self.peeked.as_ref().unwrap().as_ref())
    }

    fn expect(&mut self, want: Token, what: &str) -> Result<(), ApplyError> {
        match self.next()? {
            Some(tok) if tok == want => Ok(()),
            _ => Err(perr(self.line(), format!("expected {what}"))),
        }
    }

    fn expect_str(&mut self, what: &str) -> Result<String, ApplyError> {
        match self.next()? {
            Some(Token::Str(s)) => Ok(s),
            _ => Err(perr(self.line(), format!("expected {what}"))),
        }
    }

    fn parse_value(&mut self) -> Result<Value, ApplyError> {
        match self.next()? {
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Int(n)) => Ok(Value::Int(n)),
            Some(Token::Ident(id)) if id == "true" => Ok(Value::Bool(true)),
            Some(Token::Ident(id)) if id == "false" => Ok(Value::Bool(false)),
            Some(Token::LBrace) => {
                let mut items = Vec::new();
                loop {
                    if matches!(self.peek()?, Some(Token::RBrace)) {
                        self.next()?;
                        break;
                    }
                    items.push(self.parse_value()?);
                    match self.peek()? {
                        Some(Token::Comma) => {
                            self.next()?;
                        }
                        Some(Token::RBrace) => {}
                        _ => return Err(perr(self.line(), "expected ',' or '}' in list")),
                    }
                }
                Ok(Value::List(items))
            }
            _ => Err(perr(self.line(), "expected a value")),
        }
    }
}

/// Parse manifest text into a [`Config`].
pub fn parse_str(text: &str) -> Result<Config, ApplyError> {
    let mut p = Parser::new(text);
    let mut cfg = Config::default();

    while let Some(tok) = p.next()? {
        let Token::Ident(name) = tok else {
            return Err(perr(p.line(), "expected option or section name"));
        };
        match name.as_str() {
            "file-resource" => {
                let id = p.expect_str("file-resource id")?;
                cfg.resources.push(parse_resource(&mut p, id)?);
            }
            "mbr" => {
                let name = p.expect_str("mbr name")?;
                cfg.mbrs.push(parse_mbr(&mut p, name)?);
            }
            "task" => {
                let title = p.expect_str("task title")?;
                cfg.tasks.push(parse_task(&mut p, title)?);
            }
            _ => {
                // Global option. Only the creation date matters to the
                // engine; everything else is informational metadata.
                p.expect(Token::Eq, "'='")?;
                let line = p.line();
                let value = p.parse_value()?;
                if name == "meta-creation-date" {
                    let Value::Str(s) = value else {
                        return Err(perr(line, "meta-creation-date must be a string"));
                    };
                    let date = NaiveDateTime::parse_from_str(&s, CREATION_DATE_FORMAT)
                        .map_err(|_| perr(line, format!("bad meta-creation-date '{s}'")))?;
                    cfg.creation_date = Some(date);
                } else {
                    debug!("ignoring global option '{name}'");
                }
            }
        }
    }

    Ok(cfg)
}

fn parse_resource(p: &mut Parser, id: String) -> Result<Resource, ApplyError> {
    p.expect(Token::LBrace, "'{'")?;
    let mut map = None;
    let mut sha256 = None;

    loop {
        match p.next()? {
            Some(Token::RBrace) => break,
            Some(Token::Ident(key)) => {
                p.expect(Token::Eq, "'='")?;
                let line = p.line();
                let value = p.parse_value()?;
                match key.as_str() {
                    "length" => {
                        let entries = int_list(&value)
                            .ok_or_else(|| perr(line, "length must be an integer list"))?;
                        let entries: Vec<u64> = entries
                            .iter()
                            .map(|&n| u64::try_from(n))
                            .collect::<Result<_, _>>()
                            .map_err(|_| perr(line, "negative length entry"))?;
                        map = Some(
                            SparseMap::new(entries).map_err(|msg| perr(line, msg))?,
                        );
                    }
                    "sha256" => {
                        let Value::Str(s) = value else {
                            return Err(perr(line, "sha256 must be a string"));
                        };
                        let bytes = hex::decode(&s)
                            .ok()
                            .and_then(|v| <[u8; 32]>::try_from(v).ok())
                            .ok_or_else(|| perr(line, "sha256 must be 64 hex characters"))?;
                        sha256 = Some(bytes);
                    }
                    _ => debug!("ignoring file-resource option '{key}'"),
                }
            }
            _ => return Err(perr(p.line(), "expected option or '}' in file-resource")),
        }
    }

    let map = map.ok_or_else(|| perr(p.line(), format!("file-resource '{id}' has no length")))?;
    Ok(Resource { id, map, sha256 })
}

fn parse_mbr(p: &mut Parser, name: String) -> Result<MbrDef, ApplyError> {
    p.expect(Token::LBrace, "'{'")?;
    let mut partitions: [Option<Partition>; 4] = [None; 4];

    loop {
        match p.next()? {
            Some(Token::RBrace) => break,
            Some(Token::Ident(key)) if key == "partition" => {
                let index = match p.next()? {
                    Some(Token::Int(n)) => n,
                    Some(Token::Str(s)) => s
                        .parse()
                        .map_err(|_| perr(p.line(), "bad partition index"))?,
                    _ => return Err(perr(p.line(), "expected partition index")),
                };
                let slot = usize::try_from(index)
                    .ok()
                    .filter(|&i| i < 4)
                    .ok_or_else(|| perr(p.line(), "partition index out of range"))?;
                partitions[slot] = Some(parse_partition(p)?);
            }
            _ => return Err(perr(p.line(), "expected partition section or '}' in mbr")),
        }
    }

    Ok(MbrDef { name, partitions })
}

fn parse_partition(p: &mut Parser) -> Result<Partition, ApplyError> {
    p.expect(Token::LBrace, "'{'")?;
    let mut part = Partition::default();
    let mut have_offset = false;

    loop {
        match p.next()? {
            Some(Token::RBrace) => break,
            Some(Token::Ident(key)) => {
                p.expect(Token::Eq, "'='")?;
                let line = p.line();
                let value = p.parse_value()?;
                match (key.as_str(), value) {
                    ("block-offset", Value::Int(n)) => {
                        part.block_offset = u32::try_from(n)
                            .map_err(|_| perr(line, "block-offset out of range"))?;
                        have_offset = true;
                    }
                    ("block-count", Value::Int(n)) => {
                        part.block_count = u32::try_from(n)
                            .map_err(|_| perr(line, "block-count out of range"))?;
                    }
                    ("type", Value::Int(n)) => {
                        part.partition_type = u8::try_from(n)
                            .map_err(|_| perr(line, "partition type out of range"))?;
                    }
                    ("boot", Value::Bool(b)) => part.boot = b,
                    (key, _) => {
                        return Err(perr(line, format!("bad partition option '{key}'")));
                    }
                }
            }
            _ => return Err(perr(p.line(), "expected option or '}' in partition")),
        }
    }

    if !have_offset {
        return Err(perr(p.line(), "partition has no block-offset"));
    }
    Ok(part)
}

fn parse_task(p: &mut Parser, title: String) -> Result<Task, ApplyError> {
    p.expect(Token::LBrace, "'{'")?;
    let mut task = Task {
        title,
        require_partition1_offset: -1,
        requirements: Vec::new(),
        on_init: None,
        on_finish: None,
        on_resource: Vec::new(),
    };

    loop {
        match p.next()? {
            Some(Token::RBrace) => break,
            Some(Token::Ident(key)) => match key.as_str() {
                "on-init" => task.on_init = Some(parse_event(p, None)?),
                "on-finish" => task.on_finish = Some(parse_event(p, None)?),
                "on-resource" => {
                    let id = p.expect_str("on-resource id")?;
                    task.on_resource.push(parse_event(p, Some(id))?);
                }
                "require-partition1-offset" => {
                    p.expect(Token::Eq, "'='")?;
                    match p.parse_value()? {
                        Value::Int(n) => task.require_partition1_offset = n,
                        _ => {
                            return Err(perr(
                                p.line(),
                                "require-partition1-offset must be an integer",
                            ));
                        }
                    }
                }
                "reqlist" => {
                    p.expect(Token::Eq, "'='")?;
                    let line = p.line();
                    let value = p.parse_value()?;
                    for chain in split_chains(line, "reqlist", &value)? {
                        task.requirements
                            .push(Requirement::parse(&chain).map_err(|msg| perr(line, msg))?);
                    }
                }
                _ => return Err(perr(p.line(), format!("bad task option '{key}'"))),
            },
            _ => return Err(perr(p.line(), "expected option or '}' in task")),
        }
    }

    Ok(task)
}

fn parse_event(p: &mut Parser, resource: Option<String>) -> Result<Event, ApplyError> {
    p.expect(Token::LBrace, "'{'")?;
    let mut actions = Vec::new();

    loop {
        match p.next()? {
            Some(Token::RBrace) => break,
            Some(Token::Ident(key)) if key == "funlist" => {
                p.expect(Token::Eq, "'='")?;
                let line = p.line();
                let value = p.parse_value()?;
                for chain in split_chains(line, "funlist", &value)? {
                    actions.push(Action::parse(&chain).map_err(|msg| perr(line, msg))?);
                }
            }
            _ => return Err(perr(p.line(), "expected funlist or '}' in event")),
        }
    }

    Ok(Event { resource, actions })
}

/// Split an argc-prefixed flat string list into invocations: each group is
/// one count followed by that many strings (name plus arguments).
fn split_chains(line: usize, what: &str, value: &Value) -> Result<Vec<Vec<String>>, ApplyError> {
    let Value::List(items) = value else {
        return Err(perr(line, format!("{what} must be a list")));
    };
    let items: Vec<&str> = items
        .iter()
        .map(|v| match v {
            Value::Str(s) => Ok(s.as_str()),
            _ => Err(perr(line, format!("{what} entries must be strings"))),
        })
        .collect::<Result<_, _>>()?;

    let mut chains = Vec::new();
    let mut i = 0;
    while i < items.len() {
        let argc: usize = items[i]
            .parse()
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| perr(line, format!("bad {what} count '{}'", items[i])))?;
        if i + 1 + argc > items.len() {
            return Err(perr(line, format!("{what} count overruns the list")));
        }
        chains.push(items[i + 1..i + 1 + argc].iter().map(|s| s.to_string()).collect());
        i += 1 + argc;
    }
    Ok(chains)
}

fn int_list(value: &Value) -> Option<Vec<i64>> {
    match value {
        Value::Int(n) => Some(vec![*n]),
        Value::List(items) => items
            .iter()
            .map(|v| match v {
                Value::Int(n) => Some(*n),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}
