//! Recursive-descent parser over the token stream. Builds the scope tree
//! and fails fast with a line-numbered [`ConfigError`] on anything it does
//! not understand.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use pnet::util::MacAddr;
use proto::code;

use crate::lexer::Lexer;
use crate::scope::{Global, Host, Network, Pool, Subnet};
use crate::settings::Settings;
use crate::tokens::{lookup_option, Multi, Tok, Token, ValueKind};
use crate::{Config, ConfigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Track {
    Root,
    Registered,
    Unregistered,
}

pub(crate) struct Parser {
    global: Global,
    networks: HashMap<String, Network>,
    hosts: HashMap<MacAddr, Host>,
}

impl Parser {
    pub(crate) fn new() -> Self {
        Parser {
            global: Global::default(),
            networks: HashMap::new(),
            hosts: HashMap::new(),
        }
    }

    pub(crate) fn into_config(self) -> Config {
        Config {
            global: self.global,
            networks: self.networks,
            hosts: self.hosts,
        }
    }

    pub(crate) fn parse_source(
        &mut self,
        src: &str,
        origin: Option<&Path>,
        stack: &mut Vec<PathBuf>,
    ) -> Result<(), ConfigError> {
        let toks = Lexer::new(src).lex();
        let mut i = 0;
        while i < toks.len() {
            match &toks[i].tok {
                Tok::Global => i = self.parse_global(&toks, i + 1)?,
                Tok::Network => i = self.parse_network(&toks, i + 1)?,
                Tok::Host => i = self.parse_host(&toks, i + 1)?,
                Tok::Include => i = self.parse_include(&toks, i + 1, origin, stack)?,
                tok => {
                    return Err(ConfigError::InvalidToken {
                        found: tok.to_string(),
                        line: toks[i].line,
                    })
                }
            }
        }
        Ok(())
    }

    fn parse_global(&mut self, toks: &[Token], start: usize) -> Result<usize, ConfigError> {
        let mut i = start;
        while i < toks.len() {
            match &toks[i].tok {
                Tok::ServerIdentifier => {
                    let (ip, next) = expect_ip(toks, i + 1)?;
                    self.global.server_identifier = ip;
                    i = next;
                }
                Tok::Registered => {
                    let (settings, next) = parse_settings_block(toks, i + 1)?;
                    self.global.registered_settings = settings;
                    i = next;
                }
                Tok::Unregistered => {
                    let (settings, next) = parse_settings_block(toks, i + 1)?;
                    self.global.unregistered_settings = settings;
                    i = next;
                }
                Tok::End => return Ok(i + 1),
                tok if tok.is_setting() => {
                    i = parse_setting(toks, i, &mut self.global.settings)?;
                }
                tok => {
                    return Err(ConfigError::UnexpectedToken {
                        found: tok.to_string(),
                        line: toks[i].line,
                        context: "global",
                    })
                }
            }
        }
        Err(ConfigError::UnexpectedEof)
    }

    fn parse_network(&mut self, toks: &[Token], start: usize) -> Result<usize, ConfigError> {
        let (name, mut i) = expect_str(toks, start)?;
        let name = name.to_lowercase();
        if self.networks.contains_key(&name) {
            return Err(ConfigError::DuplicateNetwork {
                name,
                line: toks[start].line,
            });
        }
        let mut network = Network::new(name.clone());
        let mut track = Track::Root;

        while i < toks.len() {
            match &toks[i].tok {
                Tok::Subnet => {
                    // a bare subnet directly under the network is
                    // unregistered
                    let short_syntax = track == Track::Root;
                    if short_syntax {
                        track = Track::Unregistered;
                    }
                    let (mut subnet, next) = parse_subnet(toks, i + 1)?;
                    subnet.allow_unknown = track == Track::Unregistered;
                    network.subnets.push(subnet);
                    i = next;
                    if short_syntax {
                        track = Track::Root;
                    }
                }
                Tok::Registered => {
                    if track != Track::Root {
                        return Err(ConfigError::UnexpectedToken {
                            found: toks[i].tok.to_string(),
                            line: toks[i].line,
                            context: "network",
                        });
                    }
                    track = Track::Registered;
                    i += 1;
                }
                Tok::Unregistered => {
                    if track != Track::Root {
                        return Err(ConfigError::UnexpectedToken {
                            found: toks[i].tok.to_string(),
                            line: toks[i].line,
                            context: "network",
                        });
                    }
                    track = Track::Unregistered;
                    i += 1;
                }
                Tok::Local => {
                    network.local = true;
                    i += 1;
                }
                Tok::IgnoreRegistration => {
                    network.ignore_registration = true;
                    i += 1;
                }
                Tok::End => {
                    if track == Track::Root {
                        self.networks.insert(name, network);
                        return Ok(i + 1);
                    }
                    track = Track::Root;
                    i += 1;
                }
                tok if tok.is_setting() => {
                    let block = match track {
                        Track::Root => &mut network.settings,
                        Track::Registered => &mut network.registered_settings,
                        Track::Unregistered => &mut network.unregistered_settings,
                    };
                    i = parse_setting(toks, i, block)?;
                }
                tok => {
                    return Err(ConfigError::UnexpectedToken {
                        found: tok.to_string(),
                        line: toks[i].line,
                        context: "network",
                    })
                }
            }
        }
        Err(ConfigError::UnexpectedEof)
    }

    fn parse_host(&mut self, toks: &[Token], start: usize) -> Result<usize, ConfigError> {
        let (mac_str, mut i) = expect_str(toks, start)?;
        let mac: MacAddr = mac_str
            .to_lowercase()
            .parse()
            .map_err(|_| ConfigError::BadMac {
                mac: mac_str.clone(),
                line: toks[start].line,
            })?;
        if self.hosts.contains_key(&mac) {
            return Err(ConfigError::DuplicateHost {
                mac: mac_str,
                line: toks[start].line,
            });
        }
        let mut host = Host::default();

        while i < toks.len() {
            match &toks[i].tok {
                Tok::FixedAddress => {
                    let (ip, next) = expect_ip(toks, i + 1)?;
                    host.fixed_address = Some(ip);
                    i = next;
                }
                Tok::End => {
                    self.hosts.insert(mac, host);
                    return Ok(i + 1);
                }
                tok if tok.is_setting() => {
                    i = parse_setting(toks, i, &mut host.settings)?;
                }
                tok => {
                    return Err(ConfigError::UnexpectedToken {
                        found: tok.to_string(),
                        line: toks[i].line,
                        context: "host",
                    })
                }
            }
        }
        Err(ConfigError::UnexpectedEof)
    }

    fn parse_include(
        &mut self,
        toks: &[Token],
        start: usize,
        origin: Option<&Path>,
        stack: &mut Vec<PathBuf>,
    ) -> Result<usize, ConfigError> {
        let (path, next) = expect_str(toks, start)?;
        let mut resolved = PathBuf::from(&path);
        if resolved.is_relative() {
            if let Some(dir) = origin.and_then(Path::parent) {
                resolved = dir.join(resolved);
            }
        }
        let canonical = resolved.canonicalize()?;
        if stack.contains(&canonical) {
            return Err(ConfigError::IncludeCycle(canonical));
        }

        let src = std::fs::read_to_string(&canonical)?;
        stack.push(canonical.clone());
        let result = self.parse_source(&src, Some(&canonical), stack);
        stack.pop();
        result.map_err(|err| ConfigError::in_file(canonical, err))?;
        Ok(next)
    }
}

fn parse_subnet(toks: &[Token], start: usize) -> Result<(Subnet, usize), ConfigError> {
    let (addr, i) = expect_ip(toks, start)?;
    let (mask, mut i) = expect_ip(toks, i)?;
    let cidr = Ipv4Net::with_netmask(addr, mask)
        .map_err(|_| ConfigError::BadNetmask {
            mask,
            line: toks[start].line,
        })?
        .trunc();
    let mut subnet = Subnet::new(cidr);

    loop {
        if i >= toks.len() {
            return Err(ConfigError::UnexpectedEof);
        }
        match &toks[i].tok {
            Tok::Pool => {
                let (pool, next) = parse_pool(toks, i + 1)?;
                subnet.pools.push(pool);
                i = next;
            }
            Tok::Range => {
                // sugar for a single-pool subnet
                let (range_start, next) = expect_ip(toks, i + 1)?;
                let (range_end, next) = expect_ip(toks, next)?;
                check_range(range_start, range_end, toks[i].line)?;
                subnet.pools.push(Pool::new(range_start, range_end));
                i = next;
            }
            Tok::End => {
                i += 1;
                break;
            }
            tok if tok.is_setting() => {
                i = parse_setting(toks, i, &mut subnet.settings)?;
            }
            tok => {
                return Err(ConfigError::UnexpectedToken {
                    found: tok.to_string(),
                    line: toks[i].line,
                    context: "subnet",
                })
            }
        }
    }

    // a subnet always hands out a mask, even if the config didn't say so
    if !subnet.settings.options.contains(code::SUBNET_MASK) {
        subnet
            .settings
            .options
            .set(code::SUBNET_MASK, cidr.netmask().octets().to_vec());
    }
    validate_pools(&subnet, toks[start].line)?;
    Ok((subnet, i))
}

fn parse_pool(toks: &[Token], start: usize) -> Result<(Pool, usize), ConfigError> {
    let mut range: Option<(Ipv4Addr, Ipv4Addr)> = None;
    let mut settings = Settings::default();
    let mut i = start;

    loop {
        if i >= toks.len() {
            return Err(ConfigError::UnexpectedEof);
        }
        match &toks[i].tok {
            Tok::Range => {
                if range.is_some() {
                    return Err(ConfigError::RangeRedeclared(toks[i].line));
                }
                let (range_start, next) = expect_ip(toks, i + 1)?;
                let (range_end, next) = expect_ip(toks, next)?;
                check_range(range_start, range_end, toks[i].line)?;
                range = Some((range_start, range_end));
                i = next;
            }
            Tok::End => {
                let (range_start, range_end) =
                    range.ok_or(ConfigError::MissingRange(toks[i].line))?;
                let mut pool = Pool::new(range_start, range_end);
                pool.settings = settings;
                return Ok((pool, i + 1));
            }
            tok if tok.is_setting() => {
                i = parse_setting(toks, i, &mut settings)?;
            }
            tok => {
                return Err(ConfigError::UnexpectedToken {
                    found: tok.to_string(),
                    line: toks[i].line,
                    context: "pool",
                })
            }
        }
    }
}

/// The settings-only block form used by global `registered`/`unregistered`
/// sections. Terminated by `end`.
fn parse_settings_block(toks: &[Token], start: usize) -> Result<(Settings, usize), ConfigError> {
    let mut settings = Settings::default();
    let mut i = start;
    while i < toks.len() {
        if toks[i].tok == Tok::End {
            return Ok((settings, i + 1));
        }
        if !toks[i].tok.is_setting() {
            return Err(ConfigError::UnexpectedToken {
                found: toks[i].tok.to_string(),
                line: toks[i].line,
                context: "settings block",
            });
        }
        i = parse_setting(toks, i, &mut settings)?;
    }
    Err(ConfigError::UnexpectedEof)
}

fn parse_setting(
    toks: &[Token],
    start: usize,
    settings: &mut Settings,
) -> Result<usize, ConfigError> {
    match &toks[start].tok {
        Tok::Option => {
            let (code, data, next) = parse_option(toks, start + 1)?;
            settings.options.set(code, data);
            Ok(next)
        }
        Tok::DefaultLeaseTime => {
            let (secs, next) = expect_seconds(toks, start + 1)?;
            settings.default_lease_time = secs;
            Ok(next)
        }
        Tok::MaxLeaseTime => {
            let (secs, next) = expect_seconds(toks, start + 1)?;
            settings.max_lease_time = secs;
            Ok(next)
        }
        Tok::FreeLeaseAfter => {
            let (secs, next) = expect_seconds(toks, start + 1)?;
            settings.free_lease_after = secs;
            Ok(next)
        }
        tok => Err(ConfigError::UnexpectedToken {
            found: tok.to_string(),
            line: toks[start].line,
            context: "settings",
        }),
    }
}

fn parse_option(toks: &[Token], start: usize) -> Result<(u8, Vec<u8>, usize), ConfigError> {
    let name = toks.get(start).ok_or(ConfigError::UnexpectedEof)?;
    match &name.tok {
        Tok::Str(option) => {
            let schema = lookup_option(option).ok_or_else(|| ConfigError::UnknownOption {
                name: option.clone(),
                line: name.line,
            })?;
            let mut data = Vec::new();
            let mut i = start + 1;
            match schema.multi {
                Multi::One => {
                    i = consume_value(toks, i, schema.value, &mut data)?;
                }
                Multi::OneOrMore => {
                    i = consume_value(toks, i, schema.value, &mut data)?;
                    while matches_kind(toks.get(i), schema.value) {
                        i = consume_value(toks, i, schema.value, &mut data)?;
                    }
                }
            }
            Ok((schema.code, data, i))
        }
        // raw numeric option code, values may mix strings and addresses
        Tok::Number(n) => {
            let code = u8::try_from(*n).map_err(|_| ConfigError::BadOptionCode {
                code: *n,
                line: name.line,
            })?;
            let mut data = Vec::new();
            let mut i = start + 1;
            loop {
                match toks.get(i).map(|t| &t.tok) {
                    Some(Tok::Str(s)) => {
                        data.extend_from_slice(s.as_bytes());
                        i += 1;
                    }
                    Some(Tok::Ip(ip)) => {
                        data.extend_from_slice(&ip.octets());
                        i += 1;
                    }
                    _ => break,
                }
            }
            if data.is_empty() {
                return Err(ConfigError::Expected {
                    expected: "option value",
                    line: name.line,
                });
            }
            Ok((code, data, i))
        }
        tok => Err(ConfigError::UnexpectedToken {
            found: tok.to_string(),
            line: name.line,
            context: "option",
        }),
    }
}

fn matches_kind(tok: Option<&Token>, kind: ValueKind) -> bool {
    matches!(
        (tok.map(|t| &t.tok), kind),
        (Some(Tok::Ip(_)), ValueKind::Ip) | (Some(Tok::Str(_)), ValueKind::Str)
    )
}

fn consume_value(
    toks: &[Token],
    i: usize,
    kind: ValueKind,
    data: &mut Vec<u8>,
) -> Result<usize, ConfigError> {
    let tok = toks.get(i).ok_or(ConfigError::UnexpectedEof)?;
    match (&tok.tok, kind) {
        (Tok::Ip(ip), ValueKind::Ip) => data.extend_from_slice(&ip.octets()),
        (Tok::Str(s), ValueKind::Str) => data.extend_from_slice(s.as_bytes()),
        (_, ValueKind::Ip) => {
            return Err(ConfigError::Expected {
                expected: "IP address",
                line: tok.line,
            })
        }
        (_, ValueKind::Str) => {
            return Err(ConfigError::Expected {
                expected: "string",
                line: tok.line,
            })
        }
    }
    Ok(i + 1)
}

fn expect_ip(toks: &[Token], i: usize) -> Result<(Ipv4Addr, usize), ConfigError> {
    match toks.get(i) {
        Some(Token {
            tok: Tok::Ip(ip), ..
        }) => Ok((*ip, i + 1)),
        Some(tok) => Err(ConfigError::Expected {
            expected: "IP address",
            line: tok.line,
        }),
        None => Err(ConfigError::UnexpectedEof),
    }
}

fn expect_str(toks: &[Token], i: usize) -> Result<(String, usize), ConfigError> {
    match toks.get(i) {
        Some(Token {
            tok: Tok::Str(s), ..
        }) => Ok((s.clone(), i + 1)),
        Some(tok) => Err(ConfigError::Expected {
            expected: "string",
            line: tok.line,
        }),
        None => Err(ConfigError::UnexpectedEof),
    }
}

fn expect_seconds(toks: &[Token], i: usize) -> Result<(Duration, usize), ConfigError> {
    match toks.get(i) {
        Some(Token {
            tok: Tok::Number(n),
            ..
        }) if *n >= 0 => Ok((Duration::from_secs(*n as u64), i + 1)),
        Some(tok) => Err(ConfigError::Expected {
            expected: "number",
            line: tok.line,
        }),
        None => Err(ConfigError::UnexpectedEof),
    }
}

fn check_range(start: Ipv4Addr, end: Ipv4Addr, line: u32) -> Result<(), ConfigError> {
    if start > end {
        return Err(ConfigError::BadRange { start, end, line });
    }
    Ok(())
}

/// Pool ranges must lie inside the subnet and must not overlap.
fn validate_pools(subnet: &Subnet, line: u32) -> Result<(), ConfigError> {
    for pool in &subnet.pools {
        if !subnet.includes(pool.range_start) || !subnet.includes(pool.range_end) {
            return Err(ConfigError::PoolOutsideSubnet {
                subnet: subnet.cidr,
                start: pool.range_start,
                end: pool.range_end,
                line,
            });
        }
    }
    let mut ranges: Vec<_> = subnet
        .pools
        .iter()
        .map(|p| (p.range_start, p.range_end))
        .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        if pair[0].1 >= pair[1].0 {
            return Err(ConfigError::OverlappingPools {
                subnet: subnet.cidr,
                line,
            });
        }
    }
    Ok(())
}
