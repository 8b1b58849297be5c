use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Camera rotation carried by the CVO (Coordination of Video Orientation)
/// header extension, 3GPP TS 26.114.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CvoRotation {
    #[default]
    Rot0 = 0,
    Rot90 = 1,
    Rot180 = 2,
    Rot270 = 3,
}

impl CvoRotation {
    pub fn from_degrees(degrees: u32) -> Self {
        match degrees % 360 {
            90 => CvoRotation::Rot90,
            180 => CvoRotation::Rot180,
            270 => CvoRotation::Rot270,
            _ => CvoRotation::Rot0,
        }
    }
}

/// Decoded CVO extension value.
///
/// The 16-bit layout is the one the engine puts on the wire:
/// extension id in the top four bits, camera facing in bit 3, the two
/// rotation bits at the bottom (bit 2 flags a horizontal flip, which is
/// rendered the same as the unflipped rotation).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CvoExtension {
    pub extension_id: u8,
    pub camera_back_facing: bool,
    pub rotation: CvoRotation,
}

impl CvoExtension {
    pub fn to_u16(self) -> u16 {
        let mut v = (self.extension_id as u16 & 0xF) << 12;
        if self.camera_back_facing {
            v |= 1 << 3;
        }
        v |= self.rotation as u16;
        v
    }

    pub fn from_u16(value: u16) -> Self {
        let extension_id = (value >> 12) as u8;
        let camera_back_facing = (value >> 3) & 1 == 1;
        let rotation = match value & 0x3 {
            1 => CvoRotation::Rot90,
            2 => CvoRotation::Rot180,
            3 => CvoRotation::Rot270,
            _ => CvoRotation::Rot0,
        };
        Self {
            extension_id,
            camera_back_facing,
            rotation,
        }
    }

    /// The word-aligned extension payload to attach under the generic
    /// profile header.
    pub fn payload(self) -> Bytes {
        let v = self.to_u16();
        Bytes::copy_from_slice(&[(v >> 8) as u8, v as u8, 0, 0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cvo_round_trip() {
        for rotation in [
            CvoRotation::Rot0,
            CvoRotation::Rot90,
            CvoRotation::Rot180,
            CvoRotation::Rot270,
        ] {
            let ext = CvoExtension {
                extension_id: 9,
                camera_back_facing: true,
                rotation,
            };
            assert_eq!(CvoExtension::from_u16(ext.to_u16()), ext);
        }
    }

    #[test]
    fn test_cvo_flip_bit_maps_to_same_rotation() {
        // bit 2 set (horizontal flip) decodes to the base rotation
        let flipped = CvoExtension::from_u16(0x9000 | 0b101);
        assert_eq!(flipped.rotation, CvoRotation::Rot90);
        assert_eq!(flipped.extension_id, 9);
    }

    #[test]
    fn test_payload_is_word_aligned() {
        let ext = CvoExtension {
            extension_id: 1,
            camera_back_facing: false,
            rotation: CvoRotation::Rot180,
        };
        assert_eq!(ext.payload().len(), 4);
    }
}
