//! Script file set resolution
//!
//! A path expression resolves to an ordered, immutable list of files:
//! - an existing file is the whole set
//! - a directory contributes every `*.sql` file directly inside it
//! - anything with `*`, `?` or `[` is a glob, where `**` spans directories
//!
//! Results are sorted lexically by path.

use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::ActionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFileSet {
    files: Vec<PathBuf>,
}

impl ScriptFileSet {
    pub fn resolve(expr: &str) -> Result<Self, ActionError> {
        let path = Path::new(expr);

        let mut files = if path.is_file() {
            vec![path.to_path_buf()]
        } else if path.is_dir() {
            sql_files_in(path)
        } else if is_glob(expr) {
            expand_glob(expr)?
        } else {
            return Err(ActionError::configuration(format!(
                "plsql-file does not exist: {expr}"
            )));
        };

        files.sort();
        files.dedup();

        if files.is_empty() {
            return Err(ActionError::configuration(format!(
                "No script files matched: {expr}"
            )));
        }
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[cfg(test)]
    pub fn from_paths(files: Vec<PathBuf>) -> Self {
        Self { files }
    }
}

fn is_glob(expr: &str) -> bool {
    expr.contains(['*', '?', '['])
}

fn sql_files_in(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
        })
        .map(|e| e.into_path())
        .collect()
}

fn expand_glob(expr: &str) -> Result<Vec<PathBuf>, ActionError> {
    // Split into a literal base directory and the wildcard remainder.
    let mut base = PathBuf::new();
    let mut rest: Vec<String> = Vec::new();
    for component in Path::new(expr).components() {
        let text = component.as_os_str().to_string_lossy().to_string();
        if rest.is_empty() && !is_glob(&text) {
            base.push(component);
        } else if !matches!(component, Component::CurDir) {
            rest.push(text);
        }
    }
    if base.as_os_str().is_empty() {
        base.push(".");
    }

    let segments = rest
        .iter()
        .map(|s| Segment::parse(s))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ActionError::configuration(format!("Invalid glob pattern '{expr}': {e}")))?;

    let mut walker = WalkDir::new(&base).follow_links(true).min_depth(1);
    if !segments.iter().any(|s| matches!(s, Segment::AnyDirs)) {
        walker = walker.max_depth(segments.len());
    }

    let mut matches = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&base) else {
            continue;
        };
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if match_segments(&segments, &parts) {
            matches.push(entry.into_path());
        }
    }
    Ok(matches)
}

/// One path component of a glob.
enum Segment {
    /// `**`
    AnyDirs,
    Name(glob_pattern::Pattern),
}

impl Segment {
    fn parse(text: &str) -> Result<Self, String> {
        if text == "**" {
            Ok(Segment::AnyDirs)
        } else {
            glob_pattern::Pattern::new(text).map(Segment::Name)
        }
    }
}

fn match_segments(segments: &[Segment], parts: &[String]) -> bool {
    match segments.split_first() {
        None => parts.is_empty(),
        Some((Segment::AnyDirs, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..]))
        }
        Some((Segment::Name(pattern), rest)) => match parts.split_first() {
            Some((head, tail)) => pattern.matches(head) && match_segments(rest, tail),
            None => false,
        },
    }
}

/// Single-component matcher: `*`, `?`, `[abc]`, `[!abc]`, `[a-z]`.
mod glob_pattern {
    pub struct Pattern {
        tokens: Vec<Token>,
    }

    enum Token {
        Literal(char),
        Any,
        AnySequence,
        Class(Vec<ClassItem>, bool),
    }

    enum ClassItem {
        Char(char),
        Range(char, char),
    }

    impl ClassItem {
        fn contains(&self, c: char) -> bool {
            match *self {
                ClassItem::Char(x) => x == c,
                ClassItem::Range(lo, hi) => lo <= c && c <= hi,
            }
        }
    }

    impl Pattern {
        pub fn new(pattern: &str) -> Result<Self, String> {
            let mut tokens = Vec::new();
            let mut chars = pattern.chars().peekable();

            while let Some(c) = chars.next() {
                match c {
                    '*' => {
                        // Collapse runs of `*`.
                        if !matches!(tokens.last(), Some(Token::AnySequence)) {
                            tokens.push(Token::AnySequence);
                        }
                    }
                    '?' => tokens.push(Token::Any),
                    '[' => {
                        let negated = matches!(chars.peek(), Some('!') | Some('^'));
                        if negated {
                            chars.next();
                        }
                        let mut items = Vec::new();
                        loop {
                            match chars.next() {
                                Some(']') if !items.is_empty() => break,
                                Some(lo) => {
                                    if chars.peek() == Some(&'-') {
                                        chars.next();
                                        match chars.next() {
                                            Some(']') => {
                                                items.push(ClassItem::Char(lo));
                                                items.push(ClassItem::Char('-'));
                                                break;
                                            }
                                            Some(hi) => items.push(ClassItem::Range(lo, hi)),
                                            None => {
                                                return Err("unterminated character class".into())
                                            }
                                        }
                                    } else {
                                        items.push(ClassItem::Char(lo));
                                    }
                                }
                                None => return Err("unterminated character class".into()),
                            }
                        }
                        tokens.push(Token::Class(items, negated));
                    }
                    other => tokens.push(Token::Literal(other)),
                }
            }

            Ok(Self { tokens })
        }

        pub fn matches(&self, text: &str) -> bool {
            let text: Vec<char> = text.chars().collect();
            Self::do_match(&self.tokens, &text)
        }

        fn do_match(tokens: &[Token], text: &[char]) -> bool {
            match tokens.split_first() {
                None => text.is_empty(),
                Some((Token::AnySequence, rest)) => {
                    (0..=text.len()).any(|k| Self::do_match(rest, &text[k..]))
                }
                Some((token, rest)) => {
                    let Some((&c, tail)) = text.split_first() else {
                        return false;
                    };
                    let ok = match token {
                        Token::Literal(l) => *l == c,
                        Token::Any => true,
                        Token::Class(items, negated) => {
                            items.iter().any(|i| i.contains(c)) != *negated
                        }
                        Token::AnySequence => unreachable!(),
                    };
                    ok && Self::do_match(rest, tail)
                }
            }
        }
    }
}
