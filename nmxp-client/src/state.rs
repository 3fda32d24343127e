/// PDS connection state machine.
///
/// Transitions: `Disconnected` → `Connected` → `DirectoryReceived` →
/// `Subscribed` → `Streaming` → `Terminating` → `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PdsState {
    /// No socket open.
    Disconnected,
    /// Socket open, CONNECT sent.
    Connected,
    /// Channel list received from the server.
    DirectoryReceived,
    /// AddTimeSeriesChannels sent.
    Subscribed,
    /// Data messages are being read.
    Streaming,
    /// TerminateSubscription being sent.
    Terminating,
    /// Socket closed; the client cannot be reused.
    Closed,
}

impl PdsState {
    /// Returns the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connected => "Connected",
            Self::DirectoryReceived => "DirectoryReceived",
            Self::Subscribed => "Subscribed",
            Self::Streaming => "Streaming",
            Self::Terminating => "Terminating",
            Self::Closed => "Closed",
        }
    }
}

/// DAP connection state machine.
///
/// Transitions: `Disconnected` → `Connected` → `Ready` → `Requesting` →
/// `Receiving` → `Ready` (next request) … → `Terminating` → `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DapState {
    Disconnected,
    /// Socket open and connection-time token received.
    Connected,
    /// Server accepted the login, or finished the previous request.
    Ready,
    /// DataRequest sent, nothing received yet.
    Requesting,
    /// Data messages for the current request are arriving.
    Receiving,
    Terminating,
    Closed,
}

impl DapState {
    /// Returns the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connected => "Connected",
            Self::Ready => "Ready",
            Self::Requesting => "Requesting",
            Self::Receiving => "Receiving",
            Self::Terminating => "Terminating",
            Self::Closed => "Closed",
        }
    }
}
