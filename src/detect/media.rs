// Media sniffing — magic-byte and extension lookup shared by posters, audio tags and the stream server.

/// Media kinds recognised from magic bytes or file extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Webp,
    Mp3,
    Flac,
    Ogg,
    Wav,
    Mp4,
    Matroska, // MKV/WebM
    TransportStream,
    Unknown,
}

impl MediaKind {
    pub fn is_image(self) -> bool {
        matches!(self, Self::Jpeg | Self::Png | Self::Gif | Self::Bmp | Self::Webp)
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Mp3 | Self::Flac | Self::Ogg | Self::Wav)
    }

    pub fn is_video(self) -> bool {
        matches!(self, Self::Mp4 | Self::Matroska | Self::TransportStream)
    }

    /// Canonical file extension including the leading dot, empty for unknown.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => ".jpg",
            Self::Png => ".png",
            Self::Gif => ".gif",
            Self::Bmp => ".bmp",
            Self::Webp => ".webp",
            Self::Mp3 => ".mp3",
            Self::Flac => ".flac",
            Self::Ogg => ".ogg",
            Self::Wav => ".wav",
            Self::Mp4 => ".mp4",
            Self::Matroska => ".mkv",
            Self::TransportStream => ".ts",
            Self::Unknown => "",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
            Self::Webp => "image/webp",
            Self::Mp3 => "audio/mpeg",
            Self::Flac => "audio/flac",
            Self::Ogg => "audio/ogg",
            Self::Wav => "audio/wav",
            Self::Mp4 => "video/mp4",
            Self::Matroska => "video/x-matroska",
            Self::TransportStream => "video/mp2t",
            Self::Unknown => "application/octet-stream",
        }
    }
}

/// Detect the media kind from the first bytes of a file.
pub fn detect_media(header: &[u8]) -> MediaKind {
    // JPEG: SOI marker followed by another marker
    if header.len() >= 3 && header[0..3] == [0xFF, 0xD8, 0xFF] {
        return MediaKind::Jpeg;
    }

    if header.len() >= 8 && header[0..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return MediaKind::Png;
    }

    if header.len() >= 6 && (&header[0..6] == b"GIF87a" || &header[0..6] == b"GIF89a") {
        return MediaKind::Gif;
    }

    if header.len() >= 2 && &header[0..2] == b"BM" {
        return MediaKind::Bmp;
    }

    // RIFF container: WEBP or WAVE at offset 8
    if header.len() >= 12 && &header[0..4] == b"RIFF" {
        match &header[8..12] {
            b"WEBP" => return MediaKind::Webp,
            b"WAVE" => return MediaKind::Wav,
            _ => {}
        }
    }

    // MP3: ID3v2 tag or an MPEG audio frame sync
    if header.len() >= 3 && &header[0..3] == b"ID3" {
        return MediaKind::Mp3;
    }
    if header.len() >= 2 && header[0] == 0xFF && header[1] & 0xE0 == 0xE0 {
        return MediaKind::Mp3;
    }

    if header.len() >= 4 && &header[0..4] == b"fLaC" {
        return MediaKind::Flac;
    }

    if header.len() >= 4 && &header[0..4] == b"OggS" {
        return MediaKind::Ogg;
    }

    // MP4/MOV: bytes 4..8 == "ftyp"
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return MediaKind::Mp4;
    }

    // MKV/WebM: EBML magic bytes at offset 0
    if header.len() >= 4 && header[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return MediaKind::Matroska;
    }

    // MPEG-TS: sync byte 0x47 at offset 0 and offset 188
    if header.len() > 188 && header[0] == 0x47 && header[188] == 0x47 {
        return MediaKind::TransportStream;
    }

    MediaKind::Unknown
}

/// Guess the media kind from a file name's extension.
pub fn kind_from_name(name: &str) -> MediaKind {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return MediaKind::Unknown,
    };
    match ext.as_str() {
        "jpg" | "jpeg" => MediaKind::Jpeg,
        "png" => MediaKind::Png,
        "gif" => MediaKind::Gif,
        "bmp" => MediaKind::Bmp,
        "webp" => MediaKind::Webp,
        "mp3" => MediaKind::Mp3,
        "flac" => MediaKind::Flac,
        "ogg" | "oga" => MediaKind::Ogg,
        "wav" => MediaKind::Wav,
        "mp4" | "m4v" | "mov" => MediaKind::Mp4,
        "mkv" | "webm" => MediaKind::Matroska,
        "ts" => MediaKind::TransportStream,
        _ => MediaKind::Unknown,
    }
}
