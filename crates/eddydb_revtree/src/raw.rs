//! Binary codec for revision trees.
//!
//! An encoded tree is a sequence of records followed by a four-byte zero
//! sentinel. Each record is:
//!
//! ```text
//! u32 BE   size          total record size, including this field
//! u16 BE   parent        index of parent revision, 0xFFFF = none
//! u8       flags         persisted public flags | private codec bits
//! u8       rev_id_len
//! bytes    rev_id
//! varint   sequence
//! -- if flags & HAS_BODY:        inline body (remainder of the record)
//! -- else if flags & HAS_BODY_OFFSET:
//! varint   old_body_offset
//! varint   body_size
//! ```
//!
//! All multi-byte integers are big-endian. Varints are unsigned LEB128.

use crate::error::{TreeError, TreeResult};
use crate::rev::{RevBody, RevFlags, RevId, Revision};

/// Private flag bit: the record carries an inline body.
const HAS_BODY: u8 = 0x80;
/// Private flag bit: the record carries a body offset/size pair.
const HAS_BODY_OFFSET: u8 = 0x40;

/// Parent field value meaning "no parent".
const NO_PARENT: u16 = 0xFFFF;

/// Fixed header bytes before the revision ID: size + parent + flags + len.
const RECORD_HEADER: usize = 4 + 2 + 1 + 1;

/// Encodes a list of revisions into the on-disk form.
///
/// The caller is responsible for ordering (see
/// [`RevTree::sort`](crate::RevTree::sort)); this function writes the
/// records exactly as given, followed by the zero sentinel.
#[must_use]
pub fn encode(revs: &[Revision]) -> Vec<u8> {
    let mut out = Vec::with_capacity(revs.iter().map(record_size).sum::<usize>() + 4);
    for rev in revs {
        let size = record_size(rev);
        out.extend_from_slice(&(size as u32).to_be_bytes());
        out.extend_from_slice(&rev.parent.unwrap_or(NO_PARENT).to_be_bytes());
        let mut flags = rev.flags.persistent().bits();
        match &rev.body {
            RevBody::Inline(_) => flags |= HAS_BODY,
            RevBody::Stored { .. } => flags |= HAS_BODY_OFFSET,
            RevBody::None => {}
        }
        out.push(flags);
        out.push(rev.rev_id.as_bytes().len() as u8);
        out.extend_from_slice(rev.rev_id.as_bytes());
        write_varint(&mut out, rev.sequence);
        match &rev.body {
            RevBody::Inline(body) => out.extend_from_slice(body),
            RevBody::Stored { offset, size } => {
                write_varint(&mut out, *offset);
                write_varint(&mut out, *size);
            }
            RevBody::None => {}
        }
    }
    out.extend_from_slice(&[0, 0, 0, 0]);
    out
}

/// Decodes an encoded revision tree.
///
/// Revisions recorded with a sequence of zero inherit `cur_seq`, the
/// sequence under which the containing document record was stored.
///
/// # Errors
///
/// Fails if the blob ends before the sentinel, a record's size field
/// cannot hold its header, a length overflows the record, or a parent
/// index is out of range or part of a cycle.
pub fn decode(data: &[u8], cur_seq: u64) -> TreeResult<Vec<Revision>> {
    let mut revs = Vec::new();
    let mut pos = 0usize;
    loop {
        if pos + 4 > data.len() {
            return Err(TreeError::Truncated);
        }
        let size = u32::from_be_bytes(data[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        if size == 0 {
            break; // sentinel
        }
        if size < RECORD_HEADER + 1 || pos.checked_add(size).map_or(true, |end| end > data.len()) {
            return Err(TreeError::InvalidRecordSize {
                size: size as u32,
                offset: pos,
            });
        }
        let record = &data[pos..pos + size];
        let parent_raw = u16::from_be_bytes(record[4..6].try_into().expect("2 bytes"));
        let flags_raw = record[6];
        let rev_id_len = record[7] as usize;

        let mut cursor = RECORD_HEADER;
        if cursor + rev_id_len > record.len() {
            return Err(TreeError::InvalidRecordSize {
                size: size as u32,
                offset: pos,
            });
        }
        let rev_id_bytes = &record[cursor..cursor + rev_id_len];
        cursor += rev_id_len;
        let rev_id = std::str::from_utf8(rev_id_bytes)
            .map_err(|_| TreeError::BadRevId(format!("{rev_id_bytes:?}")))
            .and_then(RevId::parse)?;

        let (sequence, used) = read_varint(&record[cursor..])?;
        cursor += used;

        let body = if flags_raw & HAS_BODY != 0 {
            RevBody::Inline(record[cursor..].to_vec())
        } else if flags_raw & HAS_BODY_OFFSET != 0 {
            let (offset, used) = read_varint(&record[cursor..])?;
            cursor += used;
            let (body_size, _) = read_varint(&record[cursor..])?;
            RevBody::Stored {
                offset,
                size: body_size,
            }
        } else {
            RevBody::None
        };

        let parent = (parent_raw != NO_PARENT).then_some(parent_raw);

        revs.push(Revision {
            rev_id,
            parent,
            flags: RevFlags::from_bits(flags_raw),
            sequence: if sequence == 0 { cur_seq } else { sequence },
            body,
        });
        pos += size;
    }
    validate_parents(&revs)?;
    Ok(revs)
}

/// Checks that every parent index is in range and that no parent chain
/// cycles. Records are sorted by priority, so a parent may legitimately
/// appear after its child.
fn validate_parents(revs: &[Revision]) -> TreeResult<()> {
    for (index, rev) in revs.iter().enumerate() {
        let Some(parent) = rev.parent else { continue };
        if parent as usize >= revs.len() || parent as usize == index {
            return Err(TreeError::BadParentIndex { parent, index });
        }
    }
    // Walk each parent chain; a chain longer than the tree is a cycle.
    for (index, _) in revs.iter().enumerate() {
        let mut cur = index;
        for _ in 0..revs.len() {
            match revs[cur].parent {
                Some(p) => cur = p as usize,
                None => break,
            }
        }
        if revs[cur].parent.is_some() {
            return Err(TreeError::BadParentIndex {
                parent: revs[cur].parent.expect("checked"),
                index: cur,
            });
        }
    }
    Ok(())
}

/// Size in bytes of one encoded record.
fn record_size(rev: &Revision) -> usize {
    let mut size = RECORD_HEADER + rev.rev_id.as_bytes().len() + varint_len(rev.sequence);
    match &rev.body {
        RevBody::Inline(body) => size += body.len(),
        RevBody::Stored { offset, size: n } => size += varint_len(*offset) + varint_len(*n),
        RevBody::None => {}
    }
    size
}

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_varint(data: &[u8]) -> TreeResult<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(TreeError::BadVarint);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(TreeError::BadVarint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(id: &str, parent: Option<u16>, flags: RevFlags, seq: u64, body: RevBody) -> Revision {
        Revision {
            rev_id: RevId::parse(id).unwrap(),
            parent,
            flags,
            sequence: seq,
            body,
        }
    }

    fn sample_tree() -> Vec<Revision> {
        vec![
            rev(
                "2-bb",
                Some(1),
                RevFlags::LEAF,
                7,
                RevBody::Inline(b"{\"n\":2}".to_vec()),
            ),
            rev(
                "1-aa",
                None,
                RevFlags::KEEP_BODY,
                3,
                RevBody::Stored {
                    offset: 1234,
                    size: 9,
                },
            ),
        ]
    }

    #[test]
    fn roundtrip_preserves_persistent_state() {
        let revs = sample_tree();
        let blob = encode(&revs);
        let decoded = decode(&blob, 0).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].rev_id.as_str(), "2-bb");
        assert_eq!(decoded[0].parent, Some(1));
        assert!(decoded[0].is_leaf());
        assert_eq!(decoded[0].sequence, 7);
        assert_eq!(decoded[0].body.inline(), Some(b"{\"n\":2}".as_ref()));
        assert_eq!(
            decoded[1].body,
            RevBody::Stored {
                offset: 1234,
                size: 9
            }
        );
        // KEEP_BODY is runtime-only and does not survive encoding.
        assert!(!decoded[1].flags.contains(RevFlags::KEEP_BODY));
    }

    #[test]
    fn encode_is_stable_after_roundtrip() {
        let blob = encode(&sample_tree());
        assert_eq!(encode(&decode(&blob, 0).unwrap()), blob);
    }

    #[test]
    fn zero_sequence_inherits_cur_seq() {
        let revs = vec![rev("1-aa", None, RevFlags::LEAF, 0, RevBody::None)];
        let decoded = decode(&encode(&revs), 42).unwrap();
        assert_eq!(decoded[0].sequence, 42);
    }

    #[test]
    fn missing_sentinel_is_truncation() {
        let mut blob = encode(&sample_tree());
        blob.truncate(blob.len() - 4);
        assert_eq!(decode(&blob, 0), Err(TreeError::Truncated));
    }

    #[test]
    fn record_overrunning_blob_is_rejected() {
        let mut blob = encode(&sample_tree());
        // Inflate the first record's size field past the end of the blob.
        let huge = (blob.len() as u32 + 100).to_be_bytes();
        blob[..4].copy_from_slice(&huge);
        assert!(matches!(
            decode(&blob, 0),
            Err(TreeError::InvalidRecordSize { .. })
        ));
    }

    #[test]
    fn undersized_record_is_rejected() {
        let mut blob = vec![0, 0, 0, 5];
        blob.extend_from_slice(&[0; 8]);
        assert!(matches!(
            decode(&blob, 0),
            Err(TreeError::InvalidRecordSize { size: 5, .. })
        ));
    }

    #[test]
    fn out_of_range_parent_index_is_rejected() {
        let revs = vec![rev("1-aa", Some(5), RevFlags::LEAF, 1, RevBody::None)];
        let blob = encode(&revs);
        assert_eq!(
            decode(&blob, 0),
            Err(TreeError::BadParentIndex {
                parent: 5,
                index: 0
            })
        );
    }

    #[test]
    fn forward_parent_index_is_accepted() {
        // Priority order stores leaves first, so a leaf's parent appears
        // after it in the record stream.
        let revs = vec![
            rev("2-bb", Some(1), RevFlags::LEAF, 2, RevBody::None),
            rev("1-aa", None, RevFlags::empty(), 1, RevBody::None),
        ];
        let decoded = decode(&encode(&revs), 0).unwrap();
        assert_eq!(decoded[0].parent, Some(1));
    }

    #[test]
    fn cyclic_parent_chain_is_rejected() {
        let revs = vec![
            rev("2-bb", Some(1), RevFlags::LEAF, 2, RevBody::None),
            rev("1-aa", Some(0), RevFlags::empty(), 1, RevBody::None),
        ];
        let blob = encode(&revs);
        assert!(matches!(
            decode(&blob, 0),
            Err(TreeError::BadParentIndex { .. })
        ));
    }

    #[test]
    fn varint_roundtrip_at_boundaries() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert_eq!(buf.len(), varint_len(v));
            assert_eq!(read_varint(&buf).unwrap(), (v, buf.len()));
        }
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let buf = [0xFFu8; 11];
        assert_eq!(read_varint(&buf), Err(TreeError::BadVarint));
    }

    #[test]
    fn empty_tree_is_just_the_sentinel() {
        let blob = encode(&[]);
        assert_eq!(blob, [0, 0, 0, 0]);
        assert!(decode(&blob, 0).unwrap().is_empty());
    }
}
