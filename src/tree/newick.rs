use std::error::Error;
use std::fmt::{self, Display};

use anyhow::bail;
use itertools::Itertools;
use log::info;

use crate::tree::{NodeArena, NodeIdx, NodeKind, Tree};
use crate::Result;

/// Errors raised while parsing Newick text. Positions are byte offsets into
/// the whitespace-stripped input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    EmptyInput,
    UnopenedBracket { position: usize },
    UnclosedBracket { position: usize },
    StrayText { position: usize },
    EmptyClade { position: usize },
    MissingLabel { position: usize },
    InvalidLabel { label: String, position: usize },
    InvalidBranchLength { text: String, position: usize },
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Malformed newick string")?;
        match self {
            ParseError::EmptyInput => write!(f, "Newick string is empty"),
            ParseError::UnopenedBracket { position } => {
                write!(f, "Bracket closed before it was opened at position {}", position)
            }
            ParseError::UnclosedBracket { position } => {
                write!(f, "Bracket opened but not closed at position {}", position)
            }
            ParseError::StrayText { position } => {
                write!(f, "Unexpected text next to a bracketed group at position {}", position)
            }
            ParseError::EmptyClade { position } => write!(
                f,
                "An internal node must have at least one child at position {}",
                position
            ),
            ParseError::MissingLabel { position } => {
                write!(f, "Leaf node label missing at position {}", position)
            }
            ParseError::InvalidLabel { label, position } => write!(
                f,
                "Label '{}' at position {} cannot be parsed as an integer and no label table was provided",
                label, position
            ),
            ParseError::InvalidBranchLength { text, position } => write!(
                f,
                "Branch length '{}' at position {} is not a valid number",
                text, position
            ),
        }
    }
}

impl Error for ParseError {}

/// A leaf label that is absent from the supplied label table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupError {
    pub label: String,
}

impl Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label '{}' does not appear in the label table", self.label)
    }
}

impl Error for LookupError {}

/// Parses a single Newick tree.
///
/// Whitespace is ignored and one trailing `;` is allowed. Leaf labels must
/// parse as unsigned integers unless `labels` supplies a table mapping label
/// strings to their positions; labels on internal nodes are discarded. A
/// missing `:distance` suffix defaults to `0.0`.
///
/// # Example
/// ```
/// use dendro::tree::newick::from_newick;
///
/// let tree = from_newick("((0:1.0,1:1.0):0.5,2:1.5);", None).unwrap();
/// assert_eq!(tree.leaf_count(), 3);
/// assert_eq!(tree.distance(0, 1).unwrap(), 2.0);
/// ```
pub fn from_newick(text: &str, labels: Option<&[&str]>) -> Result<Tree> {
    info!("Parsing newick tree.");
    let cleaned: String = text.split_whitespace().collect();
    let trimmed = cleaned.strip_suffix(';').unwrap_or(&cleaned);
    if trimmed.is_empty() {
        bail!(ParseError::EmptyInput);
    }
    let mut arena = NodeArena::new();
    let (root, _) = parse_subtree(&mut arena, trimmed, 0, labels)?;
    Tree::new(arena, root)
}

/// Serialises `tree` to Newick text; children are emitted in construction
/// order, so the output is reproducible across runs.
pub fn to_newick(tree: &Tree) -> String {
    format!("{};", subtree_text(tree, &tree.root()))
}

fn subtree_text(tree: &Tree, idx: &NodeIdx) -> String {
    let node = tree.node(idx);
    match &node.kind {
        NodeKind::Leaf { index } => index.to_string(),
        NodeKind::Internal { children } => {
            let inner = children
                .iter()
                .map(|child| format!("{}:{}", subtree_text(tree, child), tree.node(child).blen))
                .join(",");
            format!("({})", inner)
        }
    }
}

// The clade boundary is the first '(' from the left and the matching ')'
// found scanning from the right, not a balanced scan over the whole string.
fn parse_subtree(
    arena: &mut NodeArena,
    text: &str,
    base: usize,
    labels: Option<&[&str]>,
) -> Result<(NodeIdx, f64)> {
    let bytes = text.as_bytes();

    let mut open = None;
    for (i, &byte) in bytes.iter().enumerate() {
        match byte {
            b'(' => {
                open = Some(i);
                break;
            }
            b')' => bail!(ParseError::UnopenedBracket { position: base + i }),
            _ => {}
        }
    }

    let mut close = None;
    for (i, &byte) in bytes.iter().enumerate().rev() {
        match byte {
            b')' => {
                close = Some(i);
                break;
            }
            b'(' => bail!(ParseError::UnclosedBracket { position: base + i }),
            _ => {}
        }
    }

    match (open, close) {
        (None, None) => parse_leaf(arena, text, base, labels),
        (Some(open), Some(close)) => parse_clade(arena, text, open, close, base, labels),
        // A lone bracket in either direction is rejected by the scans above.
        _ => unreachable!(),
    }
}

fn parse_leaf(
    arena: &mut NodeArena,
    text: &str,
    base: usize,
    labels: Option<&[&str]>,
) -> Result<(NodeIdx, f64)> {
    let (label, blen) = split_branch_length(text, base)?;
    if label.is_empty() {
        bail!(ParseError::MissingLabel { position: base });
    }
    let index = match label.parse::<usize>() {
        Ok(index) => index,
        Err(_) => match labels {
            Some(labels) => match labels.iter().position(|&known| known == label) {
                Some(index) => index,
                None => bail!(LookupError {
                    label: label.to_string(),
                }),
            },
            None => bail!(ParseError::InvalidLabel {
                label: label.to_string(),
                position: base,
            }),
        },
    };
    Ok((arena.leaf(index), blen))
}

fn parse_clade(
    arena: &mut NodeArena,
    text: &str,
    open: usize,
    close: usize,
    base: usize,
    labels: Option<&[&str]>,
) -> Result<(NodeIdx, f64)> {
    if open > 0 {
        bail!(ParseError::StrayText { position: base });
    }
    // The suffix may carry a label and a branch length; the label is discarded.
    let (label, blen) = split_branch_length(&text[close + 1..], base + close + 1)?;
    if label.contains(',') {
        bail!(ParseError::StrayText {
            position: base + close + 1,
        });
    }

    let inner = &text[open + 1..close];
    if inner.is_empty() {
        bail!(ParseError::EmptyClade {
            position: base + open,
        });
    }

    let mut children = Vec::new();
    let mut lengths = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, &byte) in inner.as_bytes().iter().enumerate() {
        match byte {
            b'(' => depth += 1,
            b')' => {
                if depth == 0 {
                    bail!(ParseError::UnopenedBracket {
                        position: base + open + 1 + i,
                    });
                }
                depth -= 1;
            }
            b',' if depth == 0 => {
                let (child, child_blen) =
                    parse_subtree(arena, &inner[start..i], base + open + 1 + start, labels)?;
                children.push(child);
                lengths.push(child_blen);
                start = i + 1;
            }
            _ => {}
        }
    }
    let (child, child_blen) =
        parse_subtree(arena, &inner[start..], base + open + 1 + start, labels)?;
    children.push(child);
    lengths.push(child_blen);

    let idx = arena.internal(children, lengths)?;
    Ok((idx, blen))
}

fn split_branch_length<'a>(text: &'a str, base: usize) -> Result<(&'a str, f64)> {
    match text.split_once(':') {
        None => Ok((text, 0.0)),
        Some((label, suffix)) => match suffix.parse::<f64>() {
            Ok(blen) => Ok((label, blen)),
            Err(_) => bail!(ParseError::InvalidBranchLength {
                text: suffix.to_string(),
                position: base + label.len() + 1,
            }),
        },
    }
}
