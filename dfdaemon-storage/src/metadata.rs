/*
 *     Copyright 2025 The Dragonfly Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use dfdaemon_config::dfdaemon::StoreStrategy;
use dfdaemon_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// PieceStyle is the wire style of a piece.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceStyle {
    /// Plain is a raw range of the task content.
    #[default]
    Plain,

    /// RangeHeader is a range served with an HTTP range header.
    RangeHeader,
}

/// Piece is the metadata of a persisted piece.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Piece {
    /// number is the piece number.
    pub number: u32,

    /// offset is the offset of the piece in the task content.
    pub offset: u64,

    /// length is the length of the piece.
    pub length: u32,

    /// style is the wire style of the piece.
    pub style: PieceStyle,

    /// md5 is the digest supplied by the caller, empty when unknown.
    pub md5: String,
}

/// PersistentMetadata is the durable descriptor of a peer task, stored as a
/// single JSON document next to the task data. The field names are part of
/// the on-disk format and must stay stable across releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentMetadata {
    /// store_strategy is the placement strategy recorded at registration, so
    /// a reload picks the same code path.
    pub store_strategy: StoreStrategy,

    /// task_id is the task id.
    pub task_id: String,

    /// peer_id is the peer id.
    pub peer_id: String,

    /// data_file_path is the path of the primary data file.
    pub data_file_path: PathBuf,

    /// content_length is the length of the task content, -1 until known.
    pub content_length: i64,

    /// total_pieces is the number of pieces of the task, -1 until known.
    pub total_pieces: i32,

    /// piece_md5_sign is the digest over the piece digests, None until known.
    pub piece_md5_sign: Option<String>,

    /// task_meta is the user supplied tags of the task.
    pub task_meta: HashMap<String, String>,

    /// pieces is the piece index of the task keyed by piece number.
    pub pieces: HashMap<u32, Piece>,
}

/// PersistentMetadata implements the task descriptor.
impl PersistentMetadata {
    /// new creates a descriptor for a freshly registered task.
    pub fn new(
        store_strategy: StoreStrategy,
        task_id: &str,
        peer_id: &str,
        data_file_path: &Path,
        content_length: i64,
        total_pieces: i32,
    ) -> PersistentMetadata {
        PersistentMetadata {
            store_strategy,
            task_id: task_id.to_string(),
            peer_id: peer_id.to_string(),
            data_file_path: data_file_path.to_path_buf(),
            content_length,
            total_pieces,
            piece_md5_sign: None,
            task_meta: HashMap::new(),
            pieces: HashMap::new(),
        }
    }

    /// contiguous_pieces returns pieces ascending by number starting at
    /// start, stopping at the first missing number, at most limit entries.
    pub fn contiguous_pieces(&self, start: u32, limit: u32) -> Vec<Piece> {
        let mut pieces = Vec::new();
        let mut number = start;
        while (pieces.len() as u32) < limit {
            match self.pieces.get(&number) {
                Some(piece) => pieces.push(piece.clone()),
                None => break,
            }

            number = match number.checked_add(1) {
                Some(number) => number,
                None => break,
            };
        }

        pieces
    }

    /// update applies the forward-only mutations of the descriptor. Unknown
    /// values may be refined to concrete ones and concrete values may be
    /// restated, but never changed.
    pub fn update(
        &mut self,
        content_length: Option<i64>,
        total_pieces: Option<i32>,
        piece_md5_sign: Option<String>,
        task_meta: Option<HashMap<String, String>>,
    ) -> Result<()> {
        // Validate every transition before applying any of them, so a failed
        // update leaves the descriptor untouched.
        let content_length = match content_length {
            Some(value) => advance_field("content_length", self.content_length, value, -1)?,
            None => self.content_length,
        };

        let total_pieces = match total_pieces {
            Some(value) => advance_field("total_pieces", self.total_pieces, value, -1)?,
            None => self.total_pieces,
        };

        if let (Some(current), Some(next)) = (&self.piece_md5_sign, &piece_md5_sign) {
            if current != next {
                return Err(Error::InvalidStateTransition(
                    format!("piece_md5_sign {}", current),
                    next.to_string(),
                ));
            }
        }

        self.content_length = content_length;
        self.total_pieces = total_pieces;
        if let Some(sign) = piece_md5_sign {
            self.piece_md5_sign = Some(sign);
        }

        if let Some(meta) = task_meta {
            self.task_meta.extend(meta);
        }

        Ok(())
    }

    /// is_complete returns whether the content length, the total piece count
    /// and the digest of the task are all known.
    pub fn is_complete(&self) -> bool {
        self.content_length >= 0 && self.total_pieces >= 0 && self.piece_md5_sign.is_some()
    }
}

/// advance_field moves a descriptor field forward. The unknown sentinel may
/// be refined to a concrete value and a concrete value may be restated, any
/// other change is rejected.
fn advance_field<T>(field: &str, current: T, next: T, unknown: T) -> Result<T>
where
    T: PartialEq + Copy + std::fmt::Display,
{
    if next == unknown || current == next {
        return Ok(current);
    }

    if current == unknown {
        return Ok(next);
    }

    Err(Error::InvalidStateTransition(
        format!("{} {}", field, current),
        next.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> PersistentMetadata {
        let mut metadata = PersistentMetadata::new(
            StoreStrategy::Simple,
            "d3c4e940ad06c47fc36ac67801e6f8e3",
            "peer-1",
            Path::new("/var/lib/dfdaemon/d3c4e940ad06c47fc36ac67801e6f8e3/peer-1/data"),
            -1,
            -1,
        );
        metadata.pieces.insert(
            0,
            Piece {
                number: 0,
                offset: 0,
                length: 1024,
                style: PieceStyle::Plain,
                md5: "digest0".to_string(),
            },
        );
        metadata
    }

    #[test]
    fn should_keep_on_disk_field_names() {
        let json = serde_json::to_value(sample_metadata()).unwrap();

        // The document fields are the on-disk format, renaming any of them
        // breaks loading tasks persisted by an older daemon.
        for field in [
            "store_strategy",
            "task_id",
            "peer_id",
            "data_file_path",
            "content_length",
            "total_pieces",
            "piece_md5_sign",
            "task_meta",
            "pieces",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }

        let piece = json.get("pieces").unwrap().get("0").unwrap();
        for field in ["number", "offset", "length", "style", "md5"] {
            assert!(piece.get(field).is_some(), "missing piece field {}", field);
        }
        assert_eq!(json["store_strategy"], "simple");
        assert_eq!(json["pieces"]["0"]["style"], "plain");
    }

    #[test]
    fn should_load_persisted_document() {
        let content = r#"{
            "store_strategy": "advance",
            "task_id": "task-1",
            "peer_id": "peer-1",
            "data_file_path": "/downloads/.out.bin.dfget.cache.peer-1",
            "content_length": 2048,
            "total_pieces": 2,
            "piece_md5_sign": "sign",
            "task_meta": {"tag": "v1"},
            "pieces": {
                "0": {"number": 0, "offset": 0, "length": 1024, "style": "plain", "md5": "a"},
                "1": {"number": 1, "offset": 1024, "length": 1024, "style": "plain", "md5": "b"}
            }
        }"#;

        let metadata: PersistentMetadata = serde_json::from_str(content).unwrap();
        assert_eq!(metadata.store_strategy, StoreStrategy::Advance);
        assert_eq!(metadata.content_length, 2048);
        assert_eq!(metadata.pieces.len(), 2);
        assert_eq!(metadata.task_meta.get("tag").unwrap(), "v1");
        assert!(metadata.is_complete());
    }

    #[test]
    fn should_return_contiguous_pieces() {
        let mut metadata = sample_metadata();
        for number in [1, 2, 4] {
            metadata.pieces.insert(
                number,
                Piece {
                    number,
                    offset: number as u64 * 1024,
                    length: 1024,
                    ..Default::default()
                },
            );
        }

        // A gap at piece 3 terminates the response.
        let pieces = metadata.contiguous_pieces(0, 10);
        assert_eq!(
            pieces.iter().map(|piece| piece.number).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        // The limit caps the response.
        let pieces = metadata.contiguous_pieces(0, 2);
        assert_eq!(pieces.len(), 2);

        // A missing start piece yields an empty response.
        assert!(metadata.contiguous_pieces(3, 10).is_empty());
        assert!(metadata.contiguous_pieces(0, 0).is_empty());
    }

    #[test]
    fn should_update_forward_only() {
        let mut metadata = sample_metadata();

        // Refine unknown values to concrete ones.
        metadata
            .update(Some(2048), Some(2), Some("sign".to_string()), None)
            .unwrap();
        assert_eq!(metadata.content_length, 2048);
        assert_eq!(metadata.total_pieces, 2);
        assert!(metadata.is_complete());

        // Restating the same values is allowed.
        metadata
            .update(Some(2048), Some(2), Some("sign".to_string()), None)
            .unwrap();

        // Changing a concrete value is not.
        let err = metadata.update(Some(4096), None, None, None).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition(_, _)));
        assert_eq!(metadata.content_length, 2048);

        let err = metadata
            .update(None, None, Some("other".to_string()), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition(_, _)));

        // Tags merge.
        metadata
            .update(
                None,
                None,
                None,
                Some(HashMap::from([("tag".to_string(), "v1".to_string())])),
            )
            .unwrap();
        assert_eq!(metadata.task_meta.get("tag").unwrap(), "v1");
    }
}
