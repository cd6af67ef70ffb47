//! Trace file loading.
//!
//! Format: a four-field header (weight, block count, operation count, peak
//! byte hint) followed by one request per line:
//!
//! ```text
//! a <block> <size>    allocate
//! r <block> <size>    reallocate
//! f <block>           free (block may be -1)
//! ```
//!
//! Fields are whitespace separated, so header values may share a line.
//! Anything after the declared number of operations is ignored.

use std::collections::TryReserveError;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::trace::{NULL_BLOCK, OpKind, Trace, TraceOperation};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("could not open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{file}: header is missing the {field} field")]
    MissingHeader { file: String, field: &'static str },
    #[error("{file}:{line}: expected {field}, found '{value}'")]
    BadNumber {
        file: String,
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("{file}:{line}: operation is missing its {field}")]
    MissingField {
        file: String,
        line: usize,
        field: &'static str,
    },
    #[error("bogus type character ({op}) in tracefile {file}, line {line}")]
    UnknownOp { op: char, file: String, line: usize },
    #[error("{file}:{line}: block index {block} outside 0..{block_count}")]
    BlockOutOfRange {
        file: String,
        line: usize,
        block: i64,
        block_count: usize,
    },
    #[error("{file}: largest allocated block index is {max_block:?}, header declares {block_count} blocks")]
    BlockCountMismatch {
        file: String,
        max_block: Option<i64>,
        block_count: usize,
    },
    #[error("{file}: header declares {block_count} blocks, too many to track: {source}")]
    TooManyBlocks {
        file: String,
        block_count: usize,
        #[source]
        source: TryReserveError,
    },
    #[error("{file}: header declares {declared} operations, found {found}")]
    OperationCountMismatch {
        file: String,
        declared: usize,
        found: usize,
    },
}

/// Read `dir/name` and parse it into a [`Trace`].
///
/// The trace is named by the joined path, which is what reports print.
pub fn load_trace(dir: &Path, name: &str) -> Result<Trace, TraceError> {
    let path = dir.join(name);
    let display = path.display().to_string();
    let text = std::fs::read_to_string(&path).map_err(|source| TraceError::Open {
        path: display.clone(),
        source,
    })?;
    parse_trace(&display, &text)
}

impl FromStr for Trace {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_trace("<memory>", s)
    }
}

/// Whitespace token stream that remembers which line each token came from.
struct Tokens<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    current: Option<(usize, std::str::SplitWhitespace<'a>)>,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().enumerate(),
            current: None,
        }
    }

    fn next_token(&mut self) -> Option<(usize, &'a str)> {
        loop {
            if let Some((line, words)) = self.current.as_mut()
                && let Some(word) = words.next()
            {
                return Some((*line, word));
            }
            let (idx, line) = self.lines.next()?;
            self.current = Some((idx + 1, line.split_whitespace()));
        }
    }
}

struct Parser<'a> {
    file: &'a str,
    tokens: Tokens<'a>,
}

impl<'a> Parser<'a> {
    fn header<T: FromStr>(&mut self, field: &'static str) -> Result<T, TraceError> {
        let (line, value) = self
            .tokens
            .next_token()
            .ok_or_else(|| TraceError::MissingHeader {
                file: self.file.to_string(),
                field,
            })?;
        self.number(line, field, value)
    }

    fn field<T: FromStr>(&mut self, op_line: usize, field: &'static str) -> Result<T, TraceError> {
        let (line, value) = self
            .tokens
            .next_token()
            .ok_or_else(|| TraceError::MissingField {
                file: self.file.to_string(),
                line: op_line,
                field,
            })?;
        self.number(line, field, value)
    }

    fn number<T: FromStr>(
        &self,
        line: usize,
        field: &'static str,
        value: &str,
    ) -> Result<T, TraceError> {
        value.parse().map_err(|_| TraceError::BadNumber {
            file: self.file.to_string(),
            line,
            field,
            value: value.to_string(),
        })
    }
}

/// Parse trace text. `file` is only used to label errors and the result.
pub fn parse_trace(file: &str, text: &str) -> Result<Trace, TraceError> {
    let mut p = Parser {
        file,
        tokens: Tokens::new(text),
    };

    let weight: i64 = p.header("weight")?;
    let block_count: usize = p.header("block count")?;
    let declared_ops: usize = p.header("operation count")?;
    let declared_peak: usize = p.header("peak byte hint")?;

    // The shortest op line is "f 0\n".
    let mut operations = Vec::with_capacity(declared_ops.min(text.len() / 4));
    let mut max_block: Option<i64> = None;

    while operations.len() < declared_ops {
        let Some((line, word)) = p.tokens.next_token() else {
            break;
        };
        // Only the first character of the word selects the op.
        let code = word.chars().next().unwrap_or(' ');
        let kind = match code {
            'a' => OpKind::Allocate,
            'r' => OpKind::Reallocate,
            'f' => OpKind::Free,
            other => {
                return Err(TraceError::UnknownOp {
                    op: other,
                    file: file.to_string(),
                    line,
                });
            }
        };

        let block: i64 = p.field(line, "block index")?;
        let size: usize = match kind {
            OpKind::Free => 0,
            OpKind::Allocate | OpKind::Reallocate => p.field(line, "size")?,
        };

        let in_range = usize::try_from(block).is_ok_and(|b| b < block_count);
        let null_free = kind == OpKind::Free && block == NULL_BLOCK;
        if !in_range && !null_free {
            return Err(TraceError::BlockOutOfRange {
                file: file.to_string(),
                line,
                block,
                block_count,
            });
        }
        if kind != OpKind::Free {
            max_block = max_block.max(Some(block));
        }

        operations.push(TraceOperation {
            kind,
            block,
            size,
            line,
        });
    }

    let expected_max = i64::try_from(block_count).ok().map(|n| n - 1);
    let consistent = match max_block {
        Some(max) => Some(max) == expected_max,
        None => block_count == 0,
    };
    if !consistent {
        return Err(TraceError::BlockCountMismatch {
            file: file.to_string(),
            max_block,
            block_count,
        });
    }
    if operations.len() != declared_ops {
        return Err(TraceError::OperationCountMismatch {
            file: file.to_string(),
            declared: declared_ops,
            found: operations.len(),
        });
    }

    Trace::new(file, weight, block_count, declared_peak, operations).map_err(|source| {
        TraceError::TooManyBlocks {
            file: file.to_string(),
            block_count,
            source,
        }
    })
}
