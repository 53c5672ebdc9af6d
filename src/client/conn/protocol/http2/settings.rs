//! SETTINGS parameters (RFC 7540 Section 6.5).

use bytes::{BufMut, BytesMut};

use super::frame::{
    ErrorCode, FrameError, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE,
};

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Window size every stream and the connection start with.
pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// The parameters carried by one SETTINGS frame. Absent values were not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) header_table_size: Option<u32>,
    pub(crate) enable_push: Option<bool>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
}

impl Settings {
    fn pairs(&self) -> impl Iterator<Item = (u16, u32)> {
        [
            (HEADER_TABLE_SIZE, self.header_table_size),
            (ENABLE_PUSH, self.enable_push.map(u32::from)),
            (MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (INITIAL_WINDOW_SIZE, self.initial_window_size),
            (MAX_FRAME_SIZE, self.max_frame_size),
            (MAX_HEADER_LIST_SIZE, self.max_header_list_size),
        ]
        .into_iter()
        .filter_map(|(id, value)| value.map(|value| (id, value)))
    }

    pub(crate) fn encoded_len(&self) -> usize {
        self.pairs().count() * 6
    }

    /// Write the frame payload: one six byte pair per value present.
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        for (id, value) in self.pairs() {
            dst.put_u16(id);
            dst.put_u32(value);
        }
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() % 6 != 0 {
            return Err(FrameError::connection(
                ErrorCode::FRAME_SIZE_ERROR,
                "SETTINGS length is not a multiple of 6",
            ));
        }

        let mut settings = Settings::default();
        for pair in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([pair[0], pair[1]]);
            let value = u32::from_be_bytes([pair[2], pair[3], pair[4], pair[5]]);
            match id {
                HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                ENABLE_PUSH => {
                    if value > 1 {
                        return Err(FrameError::connection(
                            ErrorCode::PROTOCOL_ERROR,
                            "ENABLE_PUSH must be 0 or 1",
                        ));
                    }
                    settings.enable_push = Some(value == 1);
                }
                MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(FrameError::connection(
                            ErrorCode::FLOW_CONTROL_ERROR,
                            "INITIAL_WINDOW_SIZE above 2^31-1",
                        ));
                    }
                    settings.initial_window_size = Some(value);
                }
                MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(FrameError::connection(
                            ErrorCode::PROTOCOL_ERROR,
                            "MAX_FRAME_SIZE out of range",
                        ));
                    }
                    settings.max_frame_size = Some(value);
                }
                MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                // Unknown identifiers are ignored.
                _ => {}
            }
        }
        Ok(settings)
    }
}

/// The effective value of every parameter for one side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PeerSettings {
    pub(crate) header_table_size: u32,
    pub(crate) enable_push: bool,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: u32,
    pub(crate) max_frame_size: u32,
    pub(crate) max_header_list_size: Option<u32>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl PeerSettings {
    /// Fold a received SETTINGS frame in, returning the change in
    /// INITIAL_WINDOW_SIZE.
    pub(crate) fn apply(&mut self, settings: &Settings) -> i64 {
        let before = i64::from(self.initial_window_size);

        if let Some(value) = settings.header_table_size {
            self.header_table_size = value;
        }
        if let Some(value) = settings.enable_push {
            self.enable_push = value;
        }
        if let Some(value) = settings.max_concurrent_streams {
            self.max_concurrent_streams = Some(value);
        }
        if let Some(value) = settings.initial_window_size {
            self.initial_window_size = value;
        }
        if let Some(value) = settings.max_frame_size {
            self.max_frame_size = value;
        }
        if let Some(value) = settings.max_header_list_size {
            self.max_header_list_size = Some(value);
        }

        i64::from(self.initial_window_size) - before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_present_values_are_encoded() {
        let settings = Settings {
            enable_push: Some(false),
            initial_window_size: Some(1 << 20),
            ..Default::default()
        };
        let mut dst = BytesMut::new();
        settings.encode(&mut dst);
        assert_eq!(dst.len(), settings.encoded_len());
        assert_eq!(
            &dst[..],
            &[0, 2, 0, 0, 0, 0, 0, 4, 0, 0x10, 0, 0]
        );
        assert_eq!(Settings::decode(&dst).unwrap(), settings);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_eq!(
            Settings::decode(&[0, 2, 0, 0, 0, 2]).unwrap_err().code,
            ErrorCode::PROTOCOL_ERROR
        );
        assert_eq!(
            Settings::decode(&[0, 4, 0x80, 0, 0, 0]).unwrap_err().code,
            ErrorCode::FLOW_CONTROL_ERROR
        );
        assert_eq!(
            Settings::decode(&[0, 5, 0, 0, 0x10, 0]).unwrap_err().code,
            ErrorCode::PROTOCOL_ERROR
        );
        assert_eq!(
            Settings::decode(&[0, 5, 0, 0]).unwrap_err().code,
            ErrorCode::FRAME_SIZE_ERROR
        );
    }

    #[test]
    fn unknown_identifiers_are_ignored() {
        assert_eq!(
            Settings::decode(&[0, 0x42, 0, 0, 0, 1]).unwrap(),
            Settings::default()
        );
    }

    #[test]
    fn apply_reports_window_delta() {
        let mut peer = PeerSettings::default();
        let delta = peer.apply(&Settings {
            initial_window_size: Some(DEFAULT_INITIAL_WINDOW_SIZE - 1000),
            max_concurrent_streams: Some(10),
            ..Default::default()
        });
        assert_eq!(delta, -1000);
        assert_eq!(peer.max_concurrent_streams, Some(10));
        assert_eq!(peer.apply(&Settings::default()), 0);
    }
}
