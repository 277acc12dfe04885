use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(TrackKind::Audio),
            "video" => Some(TrackKind::Video),
            _ => None,
        }
    }
}

/// Descriptor of a media track. Sample data flows through the platform, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }
}

/// One data-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    Text(String),
    Binary(Bytes),
}

impl DataFrame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataFrame::Text(text) => Some(text),
            DataFrame::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataFrame::Text(text) => text.len(),
            DataFrame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for DataFrame {
    fn from(value: &str) -> Self {
        DataFrame::Text(value.to_string())
    }
}

impl From<String> for DataFrame {
    fn from(value: String) -> Self {
        DataFrame::Text(value)
    }
}

impl From<Bytes> for DataFrame {
    fn from(value: Bytes) -> Self {
        DataFrame::Binary(value)
    }
}

impl From<Vec<u8>> for DataFrame {
    fn from(value: Vec<u8>) -> Self {
        DataFrame::Binary(Bytes::from(value))
    }
}
