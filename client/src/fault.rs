//! Classification of relay-side fetch failures reported as inner 502s.

/// A transient relay condition worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayFault {
    DeadlineExceeded,
    OverQuota,
    FetchClosed,
}

pub trait FaultClassifier: Send + Sync {
    /// `None` means the 502 came from the origin itself.
    fn classify(&self, body: &[u8]) -> Option<RelayFault>;
}

/// Recognizes the error texts of the relay's fetch facility.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlFetchMarkers;

const MARKERS: &[(&[u8], RelayFault)] = &[
    (b"DEADLINE_EXCEEDED", RelayFault::DeadlineExceeded),
    (b"ver quota", RelayFault::OverQuota),
    (b"urlfetch: CLOSED", RelayFault::FetchClosed),
];

impl FaultClassifier for UrlFetchMarkers {
    fn classify(&self, body: &[u8]) -> Option<RelayFault> {
        MARKERS
            .iter()
            .find(|(marker, _)| contains(body, marker))
            .map(|(_, fault)| *fault)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
