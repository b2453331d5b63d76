//! Expression tokenisation.
//!
//! Expression strings mix literal text with `$NAME` and `$(NAME)` variable
//! references, `$(name args…)` function calls, `$action(sources…)` action
//! expansions and `$$` escapes. The scanner below is deterministic and
//! single-pass; the caller drives substitution by walking the token stream
//! while counting parenthesis nesting (see the `Lparen`/`Rparen` tokens).

use once_cell::sync::Lazy;
use regex::Regex;

/// One lexical element of an expression string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    /// Literal text, copied through untouched.
    Text(&'a str),
    /// `$NAME`.
    Var(&'a str),
    /// `$(NAME)`.
    ParenVar(&'a str),
    /// `$(name ` — opens a function call, closed by the matching `Rparen`.
    /// `raw` is the exact matched text, including the whitespace character.
    Funct { name: &'a str, raw: &'a str },
    /// `$name(` — opens an action expansion, closed by the matching `Rparen`.
    Action { name: &'a str, raw: &'a str },
    /// `$$`, a literal dollar sign.
    Dollar,
    /// An unescaped `(` outside of the openers above.
    Lparen,
    /// An unescaped `)`.
    Rparen,
}

/// Tokenises `input`.
pub fn tokens(input: &str) -> Tokens<'_> {
    Tokens {
        input,
        pos: 0,
        pending: None,
    }
}

pub struct Tokens<'a> {
    input: &'a str,
    pos: usize,
    pending: Option<(Token<'a>, usize)>,
}

fn is_word(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

impl<'a> Tokens<'a> {
    /// Returns the token starting at byte `i`, if any, along with the byte
    /// offset just past it. A `$` preceded by another `$` never starts a
    /// token; neither does a parenthesis preceded by a backslash (the caller
    /// skips those before calling here).
    fn special_at(&self, i: usize) -> Option<(Token<'a>, usize)> {
        let bytes = self.input.as_bytes();
        match bytes[i] {
            b'$' => {
                if bytes.get(i + 1) == Some(&b'$') {
                    return Some((Token::Dollar, i + 2));
                }
                if i > 0 && bytes[i - 1] == b'$' {
                    return None;
                }
                match bytes.get(i + 1) {
                    Some(&c) if is_word(c) => {
                        let mut j = i + 1;
                        while j < bytes.len() && is_word(bytes[j]) {
                            j += 1;
                        }
                        if bytes.get(j) == Some(&b'(') {
                            Some((
                                Token::Action {
                                    name: &self.input[i + 1..j],
                                    raw: &self.input[i..j + 1],
                                },
                                j + 1,
                            ))
                        } else {
                            Some((Token::Var(&self.input[i + 1..j]), j))
                        }
                    }
                    Some(&b'(') => {
                        let mut j = i + 2;
                        while j < bytes.len() && is_word(bytes[j]) {
                            j += 1;
                        }
                        if j == i + 2 {
                            return None;
                        }
                        match bytes.get(j) {
                            Some(&b')') => {
                                Some((Token::ParenVar(&self.input[i + 2..j]), j + 1))
                            }
                            Some(&c) if c.is_ascii_whitespace() => Some((
                                Token::Funct {
                                    name: &self.input[i + 2..j],
                                    raw: &self.input[i..j + 1],
                                },
                                j + 1,
                            )),
                            _ => None,
                        }
                    }
                    _ => None,
                }
            }
            b'(' => Some((Token::Lparen, i + 1)),
            b')' => Some((Token::Rparen, i + 1)),
            _ => None,
        }
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        if let Some((token, end)) = self.pending.take() {
            self.pos = end;
            return Some(token);
        }
        let bytes = self.input.as_bytes();
        if self.pos >= bytes.len() {
            return None;
        }
        let start = self.pos;
        let mut i = start;
        while i < bytes.len() {
            if bytes[i] == b'\\' && matches!(bytes.get(i + 1), Some(&b'(') | Some(&b')')) {
                // Escaped parentheses stay literal, backslash included.
                i += 2;
                continue;
            }
            if let Some((token, end)) = self.special_at(i) {
                if i > start {
                    self.pending = Some((token, end));
                    self.pos = i;
                    return Some(Token::Text(&self.input[start..i]));
                }
                self.pos = end;
                return Some(token);
            }
            i += 1;
        }
        self.pos = i;
        Some(Token::Text(&self.input[start..]))
    }
}

/// Splits on whitespace while keeping parenthesised groups attached to the
/// word they follow, so `link(a.c b.c) x` becomes `["link(a.c b.c)", "x"]`.
/// An unterminated group swallows the rest of the input.
pub fn split(input: &str) -> Vec<String> {
    let bytes = input.as_bytes();
    let mut results: Vec<String> = Vec::new();
    let mut start = 0;
    loop {
        let pos = match input[start..].find('(') {
            Some(rel) => start + rel,
            None => {
                results.extend(input[start..].split_whitespace().map(str::to_owned));
                return results;
            }
        };
        let mut end = pos + 1;
        let mut level = 1u32;
        while end < bytes.len() {
            match bytes[end] {
                b'(' => level += 1,
                b')' => {
                    level -= 1;
                    if level == 0 {
                        break;
                    }
                }
                _ => {}
            }
            end += 1;
        }
        results.extend(input[start..=pos].split_whitespace().map(str::to_owned));
        let tail = &input[pos + 1..(end + 1).min(input.len())];
        if let Some(last) = results.last_mut() {
            last.push_str(tail);
        }
        if level == 0 {
            start = end + 1;
        } else {
            return results;
        }
    }
}

static ACTION_SOURCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\$)?(\w+)\((.*)\)$").unwrap());

/// Splits `action(src1 src2 …)` into the action name and the raw sources
/// text. Returns `None` for anything that does not have that shape.
pub fn split_action_sources(input: &str) -> Option<(&str, &str)> {
    ACTION_SOURCES.captures(input).map(|c| {
        (
            c.get(1).map_or("", |m| m.as_str()),
            c.get(2).map_or("", |m| m.as_str()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(input: &str) -> Vec<Token<'_>> {
        tokens(input).collect()
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(all("gcc -c main.c"), vec![Token::Text("gcc -c main.c")]);
        assert!(all("").is_empty());
    }

    #[test]
    fn test_variables() {
        assert_eq!(
            all("gcc $CFLAGS -o $(OUT)"),
            vec![
                Token::Text("gcc "),
                Token::Var("CFLAGS"),
                Token::Text(" -o "),
                Token::ParenVar("OUT"),
            ]
        );
    }

    #[test]
    fn test_function_open() {
        assert_eq!(
            all("$(shell uname)"),
            vec![
                Token::Funct {
                    name: "shell",
                    raw: "$(shell ",
                },
                Token::Text("uname"),
                Token::Rparen,
            ]
        );
    }

    #[test]
    fn test_action_open() {
        assert_eq!(
            all("$compile(main.c)"),
            vec![
                Token::Action {
                    name: "compile",
                    raw: "$compile(",
                },
                Token::Text("main.c"),
                Token::Rparen,
            ]
        );
    }

    #[test]
    fn test_dollar_escape() {
        assert_eq!(all("a$$b"), vec![Token::Text("a"), Token::Dollar, Token::Text("b")]);
        // A `$` right behind a consumed `$$` is literal text.
        assert_eq!(
            all("$$$VAR"),
            vec![Token::Dollar, Token::Text("$VAR")]
        );
    }

    #[test]
    fn test_bare_dollar_is_literal() {
        assert_eq!(
            all("$ $X"),
            vec![Token::Text("$ "), Token::Var("X")]
        );
        // `$(` without a name does not open anything; the parenthesis counts.
        assert_eq!(
            all("$()"),
            vec![Token::Text("$"), Token::Lparen, Token::Rparen]
        );
    }

    #[test]
    fn test_escaped_parens() {
        assert_eq!(all(r"a\(b\)c"), vec![Token::Text(r"a\(b\)c")]);
        assert_eq!(
            all("a(b)c"),
            vec![
                Token::Text("a"),
                Token::Lparen,
                Token::Text("b"),
                Token::Rparen,
                Token::Text("c"),
            ]
        );
    }

    #[test]
    fn test_nested_call() {
        assert_eq!(
            all("$(join $DIR (a b))"),
            vec![
                Token::Funct {
                    name: "join",
                    raw: "$(join ",
                },
                Token::Var("DIR"),
                Token::Text(" "),
                Token::Lparen,
                Token::Text("a b"),
                Token::Rparen,
                Token::Rparen,
            ]
        );
    }

    #[test]
    fn test_split_plain() {
        assert_eq!(split("a b  c"), vec!["a", "b", "c"]);
        assert!(split("").is_empty());
    }

    #[test]
    fn test_split_groups() {
        assert_eq!(
            split("compile(a.c b.c) main.o"),
            vec!["compile(a.c b.c)", "main.o"]
        );
        assert_eq!(
            split("x link(a (b c) d) y"),
            vec!["x", "link(a (b c) d)", "y"]
        );
    }

    #[test]
    fn test_split_unterminated_group() {
        // The open group swallows the rest of the input.
        assert_eq!(split("a link(b c"), vec!["a", "link(b c"]);
    }

    #[test]
    fn test_split_action_sources() {
        assert_eq!(
            split_action_sources("compile(a.c b.c)"),
            Some(("compile", "a.c b.c"))
        );
        assert_eq!(
            split_action_sources("$compile(a.c)"),
            Some(("compile", "a.c"))
        );
        assert_eq!(split_action_sources("compile()"), Some(("compile", "")));
        assert_eq!(split_action_sources("main.o"), None);
        assert_eq!(split_action_sources("compile(a.c) trailing"), None);
    }
}
