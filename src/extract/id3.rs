// ID3v1 reader — the fixed 128-byte tag at the end of an MP3 file.

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{AudioMetadata, AudioMetadataReader, TorrentFileReader};

const TAG_LEN: u64 = 128;

#[derive(Debug, Default, Clone, Copy)]
pub struct Id3v1Reader;

impl Id3v1Reader {
    pub fn new() -> Self {
        Self
    }
}

/// Latin-1 field, cut at the first nul and trimmed.
fn text_field(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text: String = raw[..end].iter().map(|&b| b as char).collect();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Parse a 128-byte ID3v1 (or v1.1) tag.
pub fn parse_tag(tag: &[u8]) -> Result<AudioMetadata> {
    if tag.len() != TAG_LEN as usize || &tag[0..3] != b"TAG" {
        return Err(anyhow!("no ID3v1 tag"));
    }

    // v1.1 stores the track number in the last comment byte after a nul.
    let (comment, track) = if tag[125] == 0 && tag[126] != 0 {
        (&tag[97..125], Some(tag[126]))
    } else {
        (&tag[97..127], None)
    };

    Ok(AudioMetadata {
        title: text_field(&tag[3..33]),
        artist: text_field(&tag[33..63]),
        album: text_field(&tag[63..93]),
        year: text_field(&tag[93..97]),
        comment: text_field(comment),
        track,
        genre: (tag[127] != 0xFF).then_some(tag[127]),
    })
}

#[async_trait]
impl AudioMetadataReader for Id3v1Reader {
    async fn read(&self, file: TorrentFileReader) -> Result<AudioMetadata> {
        if file.len() < TAG_LEN {
            return Err(anyhow!("{} is too short for an ID3v1 tag", file.name()));
        }
        let tag = file.read_tail(TAG_LEN).await?;
        parse_tag(&tag)
    }
}
