//! Rich-text deltas: insert / retain / delete with formatting attributes.
//!
//! A document is a delta made only of inserts. Lengths count Unicode scalar
//! values. Compose and transform follow the usual rich-text delta rules:
//! `null` attribute values remove a format, and when two inserts land at
//! the same position the one committed first stays in front.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

pub type Attributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextComponent {
    Insert {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Retain {
        count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Delete {
        count: usize,
    },
}

impl TextComponent {
    pub fn len(&self) -> usize {
        match self {
            TextComponent::Insert { text, .. } => text.chars().count(),
            TextComponent::Retain { count, .. } | TextComponent::Delete { count } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn attributes(&self) -> Option<&Attributes> {
        match self {
            TextComponent::Insert { attributes, .. } | TextComponent::Retain { attributes, .. } => {
                attributes.as_ref()
            }
            TextComponent::Delete { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Insert,
    Retain,
    Delete,
}

/// Walks a component list, handing out slices of at most a requested length.
/// Past the end it yields an unbounded plain retain.
struct Cursor<'a> {
    ops: &'a [TextComponent],
    index: usize,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(ops: &'a [TextComponent]) -> Self {
        Self { ops, index: 0, offset: 0 }
    }

    fn has_next(&self) -> bool {
        self.peek_len() < usize::MAX
    }

    fn peek_len(&self) -> usize {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => usize::MAX,
        }
    }

    fn peek_kind(&self) -> Kind {
        match self.ops.get(self.index) {
            Some(TextComponent::Insert { .. }) => Kind::Insert,
            Some(TextComponent::Delete { .. }) => Kind::Delete,
            _ => Kind::Retain,
        }
    }

    fn next(&mut self, max: usize) -> TextComponent {
        let Some(op) = self.ops.get(self.index) else {
            return TextComponent::Retain { count: usize::MAX, attributes: None };
        };
        let offset = self.offset;
        let remaining = op.len() - offset;
        let length = if max >= remaining {
            self.index += 1;
            self.offset = 0;
            remaining
        } else {
            self.offset += max;
            max
        };
        match op {
            TextComponent::Delete { .. } => TextComponent::Delete { count: length },
            TextComponent::Retain { attributes, .. } => TextComponent::Retain {
                count: length,
                attributes: attributes.clone(),
            },
            TextComponent::Insert { text, attributes } => TextComponent::Insert {
                text: text.chars().skip(offset).take(length).collect(),
                attributes: attributes.clone(),
            },
        }
    }

    fn next_all(&mut self) -> TextComponent {
        self.next(usize::MAX)
    }
}

fn non_empty(attrs: Attributes) -> Option<Attributes> {
    (!attrs.is_empty()).then_some(attrs)
}

fn compose_attributes(
    base: Option<&Attributes>,
    change: Option<&Attributes>,
    keep_null: bool,
) -> Option<Attributes> {
    let mut out = base.cloned().unwrap_or_default();
    if let Some(change) = change {
        for (k, v) in change {
            out.insert(k.clone(), v.clone());
        }
    }
    if !keep_null {
        out.retain(|_, v| !v.is_null());
    }
    non_empty(out)
}

/// Attributes of `incoming` that survive after `applied` formatted the same span.
fn transform_attributes(
    applied: Option<&Attributes>,
    incoming: Option<&Attributes>,
    applied_first: bool,
) -> Option<Attributes> {
    let incoming = incoming?;
    let Some(applied) = applied else {
        return Some(incoming.clone());
    };
    if !applied_first {
        return Some(incoming.clone());
    }
    non_empty(
        incoming
            .iter()
            .filter(|(k, _)| !applied.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta {
    ops: Vec<TextComponent>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain document holding `text`.
    pub fn from_text(text: &str) -> Self {
        Self::new().insert(text, None)
    }

    pub fn ops(&self) -> &[TextComponent] {
        &self.ops
    }

    pub fn insert(mut self, text: &str, attributes: Option<Attributes>) -> Self {
        self.push(TextComponent::Insert {
            text: text.to_string(),
            attributes,
        });
        self
    }

    pub fn retain(mut self, count: usize, attributes: Option<Attributes>) -> Self {
        self.push(TextComponent::Retain { count, attributes });
        self
    }

    pub fn delete(mut self, count: usize) -> Self {
        self.push(TextComponent::Delete { count });
        self
    }

    /// Append a component, merging with its neighbour where possible and
    /// keeping inserts ahead of adjacent deletes.
    pub fn push(&mut self, op: TextComponent) {
        if op.is_empty() {
            return;
        }
        let mut index = self.ops.len();
        if let (Some(TextComponent::Delete { count: last }), TextComponent::Delete { count }) =
            (self.ops.last_mut(), &op)
        {
            *last = last.saturating_add(*count);
            return;
        }
        if matches!(self.ops.last(), Some(TextComponent::Delete { .. }))
            && matches!(op, TextComponent::Insert { .. })
        {
            index -= 1;
            if index == 0 {
                self.ops.insert(0, op);
                return;
            }
        }
        if index > 0 {
            let prev = &mut self.ops[index - 1];
            if prev.attributes() == op.attributes() {
                match (prev, &op) {
                    (TextComponent::Insert { text: a, .. }, TextComponent::Insert { text: b, .. }) => {
                        a.push_str(b);
                        return;
                    }
                    (
                        TextComponent::Retain { count: a, .. },
                        TextComponent::Retain { count: b, .. },
                    ) => {
                        *a = a.saturating_add(*b);
                        return;
                    }
                    _ => {}
                }
            }
        }
        self.ops.insert(index, op);
    }

    /// Drop a trailing plain retain.
    fn chop(mut self) -> Self {
        if let Some(TextComponent::Retain { attributes: None, .. }) = self.ops.last() {
            self.ops.pop();
        }
        self
    }

    /// Whether this delta leaves any document unchanged.
    pub fn is_noop(&self) -> bool {
        self.ops.iter().all(|op| {
            matches!(op, TextComponent::Retain { attributes: None, .. })
                || op.is_empty()
        })
    }

    /// Whether this delta is a document (inserts only).
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, TextComponent::Insert { .. }))
    }

    /// Document length in characters.
    pub fn doc_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, TextComponent::Insert { .. }))
            .map(TextComponent::len)
            .sum()
    }

    /// Length of the document this delta expects to be applied to.
    pub fn base_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| !matches!(op, TextComponent::Insert { .. }))
            .map(TextComponent::len)
            .sum()
    }

    /// Plain text of a document delta, formatting dropped.
    pub fn plain_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                TextComponent::Insert { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Sequential composition: `self` followed by `other`.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut this = Cursor::new(&self.ops);
        let mut that = Cursor::new(&other.ops);
        let mut out = Delta::new();
        while this.has_next() || that.has_next() {
            if that.peek_kind() == Kind::Insert {
                out.push(that.next_all());
            } else if this.peek_kind() == Kind::Delete {
                out.push(this.next_all());
            } else {
                let length = this.peek_len().min(that.peek_len());
                let a = this.next(length);
                let b = that.next(length);
                match b {
                    TextComponent::Retain { attributes: ref b_attrs, .. } => {
                        let a_is_retain = matches!(a, TextComponent::Retain { .. });
                        let attributes =
                            compose_attributes(a.attributes(), b_attrs.as_ref(), a_is_retain);
                        match a {
                            TextComponent::Retain { .. } => out.push(TextComponent::Retain {
                                count: length,
                                attributes,
                            }),
                            TextComponent::Insert { text, .. } => {
                                out.push(TextComponent::Insert { text, attributes })
                            }
                            TextComponent::Delete { .. } => {}
                        }
                    }
                    TextComponent::Delete { .. } => {
                        if matches!(a, TextComponent::Retain { .. }) {
                            out.push(b);
                        }
                    }
                    TextComponent::Insert { .. } => {}
                }
            }
        }
        out.chop()
    }

    /// Apply this delta to a document.
    pub fn apply(&self, doc: &Delta) -> Result<Delta, SyncError> {
        if !doc.is_document() {
            return Err(SyncError::InvalidOp("text document contains non-insert components".into()));
        }
        let needed = self.base_len();
        let available = doc.doc_len();
        if needed > available {
            return Err(SyncError::InvalidOp(format!(
                "text op spans {needed} characters, document has {available}"
            )));
        }
        Ok(doc.compose(self))
    }

    /// Rewrite `self` so it applies after `applied`, committed first against
    /// the same base. Inserts from `applied` keep priority at equal positions.
    pub fn transform(&self, applied: &Delta) -> Delta {
        let mut first = Cursor::new(&applied.ops);
        let mut second = Cursor::new(&self.ops);
        let mut out = Delta::new();
        while first.has_next() || second.has_next() {
            if first.peek_kind() == Kind::Insert {
                let skipped = first.next_all().len();
                out.push(TextComponent::Retain { count: skipped, attributes: None });
            } else if second.peek_kind() == Kind::Insert {
                out.push(second.next_all());
            } else {
                let length = first.peek_len().min(second.peek_len());
                let a = first.next(length);
                let b = second.next(length);
                if matches!(a, TextComponent::Delete { .. }) {
                    continue;
                }
                match b {
                    TextComponent::Delete { .. } => out.push(b),
                    _ => out.push(TextComponent::Retain {
                        count: length,
                        attributes: transform_attributes(a.attributes(), b.attributes(), true),
                    }),
                }
            }
        }
        out.chop()
    }

    /// Delta turning document `old` into document `new`: retains the common
    /// prefix, then replaces the differing middle.
    pub fn diff(old: &Delta, new: &Delta) -> Delta {
        let a = flatten(old);
        let b = flatten(new);
        let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
        let suffix = a[prefix..]
            .iter()
            .rev()
            .zip(b[prefix..].iter().rev())
            .take_while(|(x, y)| x == y)
            .count();

        let mut out = Delta::new().retain(prefix, None);
        out = out.delete(a.len() - prefix - suffix);
        for (ch, attrs) in &b[prefix..b.len() - suffix] {
            out.push(TextComponent::Insert {
                text: ch.to_string(),
                attributes: attrs.cloned(),
            });
        }
        out.chop()
    }
}

fn flatten(doc: &Delta) -> Vec<(char, Option<&Attributes>)> {
    doc.ops
        .iter()
        .filter_map(|op| match op {
            TextComponent::Insert { text, attributes } => Some((text, attributes.as_ref())),
            _ => None,
        })
        .flat_map(|(text, attrs)| text.chars().map(move |c| (c, attrs)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bold() -> Option<Attributes> {
        Some(Attributes::from([("bold".to_string(), json!(true))]))
    }

    #[test]
    fn test_push_merges_and_orders() {
        let d = Delta::new().insert("ab", None).insert("c", None);
        assert_eq!(d.ops().len(), 1);

        let d = Delta::new().retain(2, None).delete(1).insert("x", None);
        assert_eq!(
            d.ops(),
            &[
                TextComponent::Retain { count: 2, attributes: None },
                TextComponent::Insert { text: "x".into(), attributes: None },
                TextComponent::Delete { count: 1 },
            ]
        );
    }

    #[test]
    fn test_apply_insert_delete_format() {
        let doc = Delta::from_text("Hello world");
        let op = Delta::new()
            .retain(6, None)
            .delete(5)
            .insert("there", None);
        let out = op.apply(&doc).unwrap();
        assert_eq!(out.plain_text(), "Hello there");

        let fmt = Delta::new().retain(5, bold());
        let out = fmt.apply(&out).unwrap();
        assert_eq!(out.ops()[0], TextComponent::Insert { text: "Hello".into(), attributes: bold() });
        assert!(out.is_document());
    }

    #[test]
    fn test_apply_rejects_overrun() {
        let doc = Delta::from_text("abc");
        assert!(Delta::new().retain(2, None).delete(5).apply(&doc).is_err());
    }

    #[test]
    fn test_transform_concurrent_inserts_converge() {
        let base = Delta::from_text("chapter");
        let a = Delta::new().insert("A-", None);
        let b = Delta::new().retain(7, None).insert("-B", None);

        let b_after_a = b.transform(&a);
        let a_after_b = a.transform(&b);
        let left = b_after_a.apply(&a.apply(&base).unwrap()).unwrap();
        let right = a_after_b.apply(&b.apply(&base).unwrap()).unwrap();
        assert_eq!(left.plain_text(), "A-chapter-B");
        assert_eq!(left, right);
    }

    #[test]
    fn test_transform_same_position_applied_first() {
        let base = Delta::from_text("xy");
        let applied = Delta::new().retain(1, None).insert("1", None);
        let incoming = Delta::new().retain(1, None).insert("2", None);
        let rebased = incoming.transform(&applied);
        let out = rebased.apply(&applied.apply(&base).unwrap()).unwrap();
        assert_eq!(out.plain_text(), "x12y");
    }

    #[test]
    fn test_transform_overlapping_deletes() {
        let base = Delta::from_text("abcdef");
        let applied = Delta::new().retain(1, None).delete(3); // removes bcd
        let incoming = Delta::new().retain(2, None).delete(3); // removes cde
        let rebased = incoming.transform(&applied);
        let out = rebased.apply(&applied.apply(&base).unwrap()).unwrap();
        assert_eq!(out.plain_text(), "af");
    }

    #[test]
    fn test_diff_reproduces_target() {
        let old = Delta::from_text("In the beginning");
        let new = Delta::new()
            .insert("In the ", None)
            .insert("very", bold())
            .insert(" beginning", None);
        let op = Delta::diff(&old, &new);
        assert_eq!(op.apply(&old).unwrap(), new);
        assert!(Delta::diff(&new, &new).is_noop());
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        let doc = Delta::from_text("héllo");
        assert_eq!(doc.doc_len(), 5);
        let op = Delta::new().retain(1, None).delete(1).insert("e", None);
        assert_eq!(op.apply(&doc).unwrap().plain_text(), "hello");
    }
}
