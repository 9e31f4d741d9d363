use thiserror::Error;

/// Errors surfaced on the wire. The display string is the exact
/// `message` value clients match on, so variants render their own name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    // Protocol errors, answered on the offending channel, which stays open.
    #[error("UnknownMessageType")]
    UnknownMessageType,
    #[error("MalformedFrame")]
    MalformedFrame,

    // Room errors, sent to the requester only.
    #[error("RoomNameEmpty")]
    RoomNameEmpty,
    #[error("RoomNotFound")]
    RoomNotFound,
    #[error("RoomAlreadyExists")]
    RoomAlreadyExists,

    // Transfer errors; the transfer moves to errored.
    #[error("TargetNotFound")]
    TargetNotFound,
    #[error("CrossRoomTransfer")]
    CrossRoomTransfer,
    #[error("TargetOffline")]
    TargetOffline,
    #[error("MemoryExhausted")]
    MemoryExhausted,
    #[error("SenderUnavailable")]
    SenderUnavailable,
    #[error("AssemblyFailed")]
    AssemblyFailed,
    #[error("TransferAlreadyActive")]
    TransferAlreadyActive,

    // Connection errors.
    #[error("DuplicateConnection")]
    DuplicateConnection,
    #[error("Inactivity")]
    Inactivity,
}

impl RelayError {
    /// Which outbound frame carries this error.
    pub fn surface(&self) -> ErrorSurface {
        use RelayError::*;
        match self {
            RoomNameEmpty | RoomNotFound | RoomAlreadyExists => ErrorSurface::Room,
            TargetNotFound | CrossRoomTransfer | TargetOffline | MemoryExhausted
            | SenderUnavailable | AssemblyFailed | TransferAlreadyActive => ErrorSurface::Transfer,
            _ => ErrorSurface::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSurface {
    Generic,
    Room,
    Transfer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_render_variant_names() {
        assert_eq!(RelayError::RoomNotFound.to_string(), "RoomNotFound");
        assert_eq!(RelayError::MemoryExhausted.to_string(), "MemoryExhausted");
        assert_eq!(RelayError::MalformedFrame.to_string(), "MalformedFrame");
    }

    #[test]
    fn surfaces_route_to_matching_frames() {
        assert_eq!(RelayError::RoomNameEmpty.surface(), ErrorSurface::Room);
        assert_eq!(RelayError::TargetOffline.surface(), ErrorSurface::Transfer);
        assert_eq!(RelayError::UnknownMessageType.surface(), ErrorSurface::Generic);
    }
}
