//! AML names and namespace paths.
//!
//! Names are built from 4-character segments. A name string may be
//! absolute (`\` prefix), parent-relative (`^` prefixes), or a bare
//! path of segments; single-segment names additionally resolve by
//! walking up through enclosing scopes.

use alloc::vec::Vec;
use core::fmt;

use crate::error::{KernelError, Result};

use super::stream::{peek_byte, take_byte, take_bytes};

/// A 4-character namespace segment, padded with underscores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameSeg(pub [u8; 4]);

impl NameSeg {
    /// Build a segment from up to 4 characters.
    pub fn new(name: &str) -> Self {
        debug_assert!(!name.is_empty() && name.len() <= 4);
        let mut seg = [b'_'; 4];
        seg[..name.len()].copy_from_slice(name.as_bytes());
        NameSeg(seg)
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for NameSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

pub fn is_lead_name_char(b: u8) -> bool {
    b.is_ascii_uppercase() || b == b'_'
}

pub fn is_name_char(b: u8) -> bool {
    is_lead_name_char(b) || b.is_ascii_digit()
}

/// An absolute path from the namespace root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsPath {
    pub segs: Vec<NameSeg>,
}

impl AbsPath {
    pub fn root() -> Self {
        Self { segs: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn child(&self, seg: NameSeg) -> Self {
        let mut segs = self.segs.clone();
        segs.push(seg);
        Self { segs }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segs.is_empty() {
            return None;
        }
        Some(Self {
            segs: self.segs[..self.segs.len() - 1].to_vec(),
        })
    }

    pub fn last(&self) -> Option<NameSeg> {
        self.segs.last().copied()
    }

    /// Whether `other` is a direct child of `self`.
    pub fn is_parent_of(&self, other: &AbsPath) -> bool {
        other.segs.len() == self.segs.len() + 1 && other.segs[..self.segs.len()] == self.segs[..]
    }
}

impl fmt::Display for AbsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\\")?;
        for (i, seg) in self.segs.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

/// How a name string anchors into the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameBase {
    /// `\` — from the root.
    Root,
    /// `^^…` — that many scopes upward.
    Parents(u8),
}

/// A parsed AML name string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameString {
    pub base: NameBase,
    pub segs: Vec<NameSeg>,
}

impl NameString {
    /// Parse from a textual form (`\_SB_.PCI0`, `^FOO`, `BAR`).
    pub fn from_str(s: &str) -> Result<Self> {
        let mut rest = s;
        let base = if let Some(stripped) = rest.strip_prefix('\\') {
            rest = stripped;
            NameBase::Root
        } else {
            let mut parents = 0u8;
            while let Some(stripped) = rest.strip_prefix('^') {
                rest = stripped;
                parents += 1;
            }
            NameBase::Parents(parents)
        };

        let mut segs = Vec::new();
        for part in rest.split('.').filter(|p| !p.is_empty()) {
            if part.len() > 4 {
                return Err(KernelError::InvalidInput);
            }
            segs.push(NameSeg::new(part));
        }

        Ok(NameString { base, segs })
    }

    pub fn single(seg: NameSeg) -> Self {
        NameString {
            base: NameBase::Parents(0),
            segs: alloc::vec![seg],
        }
    }

    /// True for a bare one-segment name, which resolves by walking up
    /// through enclosing scopes.
    pub fn is_bare_single_seg(&self) -> bool {
        self.base == NameBase::Parents(0) && self.segs.len() == 1
    }

    /// The absolute path this name designates when rooted at `scope`.
    pub fn resolve_from(&self, scope: &AbsPath) -> Result<AbsPath> {
        let mut base = match self.base {
            NameBase::Root => AbsPath::root(),
            NameBase::Parents(n) => {
                let mut path = scope.clone();
                for _ in 0..n {
                    path = path.parent().ok_or(KernelError::InvalidInput)?;
                }
                path
            }
        };
        base.segs.extend_from_slice(&self.segs);
        Ok(base)
    }
}

impl fmt::Display for NameString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            NameBase::Root => write!(f, "\\")?,
            NameBase::Parents(n) => {
                for _ in 0..n {
                    write!(f, "^")?;
                }
            }
        }
        for (i, seg) in self.segs.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

/// Whether the next byte could start a name string.
pub fn can_parse_name_string(data: &[u8]) -> bool {
    match data.first() {
        Some(&b) => is_lead_name_char(b) || b == b'\\' || b == b'^' || b == 0x2E || b == 0x2F,
        None => false,
    }
}

fn parse_name_seg(data: &mut &[u8]) -> Result<NameSeg> {
    let bytes = take_bytes(data, 4)?;
    if !is_lead_name_char(bytes[0])
        || !is_name_char(bytes[1])
        || !is_name_char(bytes[2])
        || !is_name_char(bytes[3])
    {
        return Err(KernelError::InvalidFormat);
    }
    Ok(NameSeg([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parse an encoded AML NameString.
pub fn parse_name_string(data: &mut &[u8]) -> Result<NameString> {
    let base = match peek_byte(data)? {
        b'\\' => {
            take_byte(data)?;
            NameBase::Root
        }
        b'^' => {
            let mut parents = 0u8;
            while peek_byte(data)? == b'^' {
                take_byte(data)?;
                parents += 1;
            }
            NameBase::Parents(parents)
        }
        _ => NameBase::Parents(0),
    };

    let mut segs = Vec::new();
    match peek_byte(data)? {
        0x00 => {
            // NullName.
            take_byte(data)?;
        }
        0x2E => {
            // DualNamePrefix.
            take_byte(data)?;
            segs.push(parse_name_seg(data)?);
            segs.push(parse_name_seg(data)?);
        }
        0x2F => {
            // MultiNamePrefix.
            take_byte(data)?;
            let count = take_byte(data)?;
            for _ in 0..count {
                segs.push(parse_name_seg(data)?);
            }
        }
        _ => segs.push(parse_name_seg(data)?),
    }

    Ok(NameString { base, segs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seg_padding() {
        assert_eq!(NameSeg::new("AB").0, *b"AB__");
        assert_eq!(NameSeg::new("_GPE").0, *b"_GPE");
    }

    #[test]
    fn test_parse_single_seg() {
        let mut data: &[u8] = b"_SB_rest";
        let name = parse_name_string(&mut data).unwrap();
        assert_eq!(name.base, NameBase::Parents(0));
        assert_eq!(name.segs, vec![NameSeg(*b"_SB_")]);
        assert_eq!(data, b"rest");
    }

    #[test]
    fn test_parse_rooted_dual() {
        let mut data: &[u8] = &[b'\\', 0x2E, b'_', b'S', b'B', b'_', b'P', b'C', b'I', b'0'];
        let name = parse_name_string(&mut data).unwrap();
        assert_eq!(name.base, NameBase::Root);
        assert_eq!(name.segs.len(), 2);
        assert_eq!(name.segs[1], NameSeg(*b"PCI0"));
    }

    #[test]
    fn test_parse_parent_prefixes() {
        let mut data: &[u8] = &[b'^', b'^', b'F', b'O', b'O', b'_'];
        let name = parse_name_string(&mut data).unwrap();
        assert_eq!(name.base, NameBase::Parents(2));
        assert_eq!(name.segs, vec![NameSeg(*b"FOO_")]);
    }

    #[test]
    fn test_resolve_from_scope() {
        let scope = NameString::from_str("\\_SB_.PCI0")
            .unwrap()
            .resolve_from(&AbsPath::root())
            .unwrap();
        assert_eq!(scope.segs.len(), 2);

        let rel = NameString::from_str("^DEV0").unwrap();
        let resolved = rel.resolve_from(&scope).unwrap();
        assert_eq!(resolved.segs, vec![NameSeg(*b"_SB_"), NameSeg(*b"DEV0")]);

        let abs = NameString::from_str("\\_PTS").unwrap();
        assert_eq!(
            abs.resolve_from(&scope).unwrap().segs,
            vec![NameSeg(*b"_PTS")]
        );
    }

    #[test]
    fn test_null_name() {
        let mut data: &[u8] = &[0x00, 0xAA];
        let name = parse_name_string(&mut data).unwrap();
        assert!(name.segs.is_empty());
        assert_eq!(data, &[0xAA]);
    }
}
