//! Binary header for point-cloud files

use bytemuck::{Pod, Zeroable};

/// Magic string identifying the points format
pub const PTS_MAGIC: [u8; 16] = *b"_POINTS_1.0_\0\0\0\0";

/// Number of attribute kinds
pub const PTS_PROP_NUM: usize = 6;

/// Point attribute kinds, used as bit flags in the header's content flags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum PtsProp {
    Point = 1,
    Normal = 2,
    Feature = 4,
    Fpfh = 8,
    Roughness = 16,
    Label = 32,
}

impl PtsProp {
    pub const ALL: [PtsProp; PTS_PROP_NUM] = [
        PtsProp::Point,
        PtsProp::Normal,
        PtsProp::Feature,
        PtsProp::Fpfh,
        PtsProp::Roughness,
        PtsProp::Label,
    ];

    /// Index of this attribute in the channel/offset tables
    pub fn index(self) -> usize {
        (self as i32).trailing_zeros() as usize
    }
}

/// Fixed-size header of a points file: magic, point count, attribute flags,
/// per-attribute channel counts and byte offsets of the attribute blocks.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PtsInfo {
    magic: [u8; 16],
    pt_num: i32,
    content_flags: i32,
    channels: [i32; 8],
    ptr_dis: [i32; 8],
}

impl PtsInfo {
    pub fn new() -> Self {
        let mut info = Self::zeroed();
        info.magic = PTS_MAGIC;
        info
    }

    pub fn pt_num(&self) -> i32 {
        self.pt_num
    }

    pub fn set_pt_num(&mut self, num: i32) {
        self.pt_num = num;
    }

    pub fn has_property(&self, ptype: PtsProp) -> bool {
        (self.content_flags & ptype as i32) != 0
    }

    pub fn channel(&self, ptype: PtsProp) -> i32 {
        if !self.has_property(ptype) {
            return 0;
        }
        self.channels[ptype.index()]
    }

    /// Set an attribute's channel count, keeping the content flag in sync.
    /// A channel count of zero removes the attribute.
    pub fn set_channel(&mut self, ptype: PtsProp, channel: i32) {
        let i = ptype.index();
        if channel > 0 {
            self.channels[i] = channel;
            self.content_flags |= ptype as i32;
        } else {
            self.channels[i] = 0;
            self.content_flags &= !(ptype as i32);
        }
    }

    /// Byte offset of the attribute's block from the start of the file
    pub fn ptr_dis(&self, ptype: PtsProp) -> i32 {
        if !self.has_property(ptype) {
            return -1;
        }
        self.ptr_dis[ptype.index()]
    }

    /// Recompute the attribute block offsets from the channel table
    pub fn set_ptr_dis(&mut self) {
        self.ptr_dis[0] = std::mem::size_of::<PtsInfo>() as i32;
        for i in 1..=PTS_PROP_NUM {
            self.ptr_dis[i] =
                self.ptr_dis[i - 1] + 4 * self.pt_num * self.channels[i - 1];
        }
    }

    /// Total byte size of the file described by this header
    pub fn sizeof_points(&self) -> usize {
        self.ptr_dis[PTS_PROP_NUM] as usize
    }

    /// Collect format errors; an empty list means the header is valid
    pub fn check_format(&self) -> Vec<String> {
        let mut msgs = Vec::new();
        if self.magic != PTS_MAGIC {
            msgs.push("wrong magic string".to_string());
        }
        if self.pt_num < 1 {
            msgs.push("the point number should be larger than 0".to_string());
        }
        if !self.has_property(PtsProp::Point) || self.channel(PtsProp::Point) != 3 {
            msgs.push("the point coordinates must be present with 3 channels".to_string());
        }
        if self.has_property(PtsProp::Label) && self.channel(PtsProp::Label) != 1 {
            msgs.push("the label channel is fixed as 1".to_string());
        }
        for (i, &ch) in self.channels.iter().take(PTS_PROP_NUM).enumerate() {
            if ch < 0 {
                msgs.push(format!("channel {} should not be negative", i));
            }
            if (ch == 0) != ((self.content_flags & (1 << i)) == 0) {
                msgs.push(format!(
                    "the content flags should be consistent with channel {}",
                    i
                ));
            }
        }
        msgs
    }
}

impl Default for PtsInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size() {
        assert_eq!(std::mem::size_of::<PtsInfo>(), 88);
    }

    #[test]
    fn test_channel_flags_stay_consistent() {
        let mut info = PtsInfo::new();
        info.set_channel(PtsProp::Point, 3);
        info.set_channel(PtsProp::Normal, 3);
        assert!(info.has_property(PtsProp::Normal));
        assert_eq!(info.channel(PtsProp::Normal), 3);

        info.set_channel(PtsProp::Normal, 0);
        assert!(!info.has_property(PtsProp::Normal));
        assert_eq!(info.channel(PtsProp::Normal), 0);
    }

    #[test]
    fn test_ptr_dis_layout() {
        let mut info = PtsInfo::new();
        info.set_pt_num(10);
        info.set_channel(PtsProp::Point, 3);
        info.set_channel(PtsProp::Normal, 3);
        info.set_channel(PtsProp::Label, 1);
        info.set_ptr_dis();

        let header = std::mem::size_of::<PtsInfo>() as i32;
        assert_eq!(info.ptr_dis(PtsProp::Point), header);
        assert_eq!(info.ptr_dis(PtsProp::Normal), header + 4 * 30);
        assert_eq!(info.ptr_dis(PtsProp::Label), header + 4 * 60);
        assert_eq!(info.sizeof_points(), header as usize + 4 * 70);
    }

    #[test]
    fn test_check_format() {
        let mut info = PtsInfo::new();
        assert!(!info.check_format().is_empty()); // no points yet

        info.set_pt_num(4);
        info.set_channel(PtsProp::Point, 3);
        info.set_ptr_dis();
        assert!(info.check_format().is_empty());

        info.magic = [0; 16];
        assert!(!info.check_format().is_empty());
    }
}
