//! Tokeniser for the network configuration DSL.

use std::net::Ipv4Addr;

use crate::tokens::{Tok, Token};

pub(crate) struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    pub(crate) fn lex(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                b'"' => {
                    self.pos += 1;
                    let tok = self.consume_string();
                    tokens.push(Token {
                        tok,
                        line: self.line,
                    });
                }
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b'#' => self.skip_line(),
                c if c.is_ascii_digit() => {
                    let line = self.line;
                    for tok in self.consume_numeric() {
                        tokens.push(Token { tok, line });
                    }
                }
                c if c.is_ascii_alphabetic() => {
                    let tok = self.consume_ident();
                    tokens.push(Token {
                        tok,
                        line: self.line,
                    });
                }
                _ => self.pos += 1,
            }
        }
        tokens
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn consume_string(&mut self) -> Tok {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'"' {
                let s = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                self.pos += 1;
                return Tok::Str(s);
            }
            if c == b'\n' {
                self.line += 1;
            }
            self.pos += 1;
        }
        Tok::Illegal(String::from_utf8_lossy(&self.src[start..]).into_owned())
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    /// Numbers, dotted quads, and CIDR. CIDR notation emits two tokens:
    /// the address and the netmask derived from the prefix length.
    fn consume_numeric(&mut self) -> Vec<Tok> {
        let start = self.pos;
        let mut dots = 0;
        let mut slash = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => {}
                b'.' => dots += 1,
                b'/' => slash = true,
                _ => break,
            }
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();

        if slash && dots == 3 {
            match parse_cidr(&text) {
                Some((addr, mask)) => vec![Tok::Ip(addr), Tok::Ip(mask)],
                None => vec![Tok::Illegal(text)],
            }
        } else if dots == 3 {
            match text.parse::<Ipv4Addr>() {
                Ok(ip) => vec![Tok::Ip(ip)],
                Err(_) => vec![Tok::Illegal(text)],
            }
        } else if dots == 0 && !slash {
            match text.parse::<i64>() {
                Ok(n) => vec![Tok::Number(n)],
                Err(_) => vec![Tok::Illegal(text)],
            }
        } else {
            vec![Tok::Illegal(text)]
        }
    }

    fn consume_ident(&mut self) -> Tok {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        Tok::lookup(&String::from_utf8_lossy(&self.src[start..self.pos]))
    }
}

fn parse_cidr(text: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let (addr, prefix) = text.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    Some((addr, Ipv4Addr::from(mask)))
}
