//! Minimal SQL lexer: enough structure to find statement boundaries, nesting
//! depth and the tokens that follow `SELECT`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    QuotedIdent,
    StringLit,
    Number,
    Param,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Parenthesis depth at which the token starts.
    pub depth: usize,
}

impl Token {
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_punct(&self, punct: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == punct
    }
}

const TWO_CHAR_OPS: [&str; 7] = ["<=", ">=", "<>", "!=", "::", "||", "=>"];

pub fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let ch = chars[i];

        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let kind = match ch {
            '\'' | '"' => {
                i = scan_quoted(&chars, i, ch, false);
                if ch == '\'' {
                    TokenKind::StringLit
                } else {
                    TokenKind::QuotedIdent
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$'))
                {
                    i += 1;
                }
                let word = chars[start..i].iter().collect::<String>().to_ascii_lowercase();
                // E'..', B'..', X'..', N'..' and U&'..' are single literals.
                match (word.as_str(), chars.get(i).copied(), chars.get(i + 1).copied()) {
                    ("e" | "b" | "x" | "n", Some('\''), _) => {
                        i = scan_quoted(&chars, i, '\'', word == "e");
                        TokenKind::StringLit
                    }
                    ("u", Some('&'), Some(quote @ ('\'' | '"'))) => {
                        i = scan_quoted(&chars, i + 1, quote, false);
                        if quote == '\'' {
                            TokenKind::StringLit
                        } else {
                            TokenKind::QuotedIdent
                        }
                    }
                    _ => TokenKind::Word,
                }
            }
            c if c.is_ascii_digit() => {
                i = scan_number(&chars, i);
                TokenKind::Number
            }
            '$' if chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) => {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                TokenKind::Param
            }
            ':' if chars
                .get(i + 1)
                .is_some_and(|c| c.is_alphabetic() || *c == '_') =>
            {
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                TokenKind::Param
            }
            _ => {
                let pair: String = chars[i..chars.len().min(i + 2)].iter().collect();
                i += if TWO_CHAR_OPS.contains(&pair.as_str()) { 2 } else { 1 };
                TokenKind::Punct
            }
        };

        let text: String = chars[start..i].iter().collect();
        if kind == TokenKind::Punct && text == ")" {
            depth = depth.saturating_sub(1);
        }
        tokens.push(Token {
            kind,
            text: text.clone(),
            depth,
        });
        if kind == TokenKind::Punct && text == "(" {
            depth += 1;
        }
    }

    tokens
}

/// Returns the index just past the closing quote; a doubled quote is an
/// escaped quote, as is a backslashed one in `E'..'` literals. Unterminated
/// literals run to the end of input.
fn scan_quoted(chars: &[char], start: usize, quote: char, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if backslash_escapes && chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn scan_number(chars: &[char], start: usize) -> usize {
    let mut i = start;
    let mut seen_dot = false;
    while i < chars.len() {
        match chars[i] {
            c if c.is_ascii_digit() => i += 1,
            '.' if !seen_dot => {
                seen_dot = true;
                i += 1;
            }
            'e' | 'E' if chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) => i += 2,
            _ => break,
        }
    }
    i
}
