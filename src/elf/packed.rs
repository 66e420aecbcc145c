// Android packed relocation 解码，处理 APS2 格式的 SLEB128 编码重定位表

use crate::errno::Errno;
use crate::log;

use super::ElfXword;

const USIZE_BITS: usize = usize::BITS as usize;

// SLEB128 变长整数解码器
struct Sleb128Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Sleb128Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn next(&mut self) -> Result<usize, Errno> {
        let mut value: usize = 0;
        let mut shift = 0usize;

        // 每次取 7 位有效数据，最高位为续传标志
        loop {
            let byte = *self.data.get(self.pos).ok_or(Errno::Format)?;
            self.pos += 1;
            if shift >= USIZE_BITS {
                return Err(Errno::Format);
            }
            value |= ((byte & 0x7f) as usize) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                // 最后一个字节的第 6 位为符号位
                if shift < USIZE_BITS && byte & 0x40 != 0 {
                    value |= !0usize << shift;
                }
                return Ok(value);
            }
        }
    }
}

// 解码后的单条重定位条目
#[derive(Debug, Eq, PartialEq)]
pub(super) struct PackedReloc {
    pub(super) r_offset: usize,
    pub(super) r_info: ElfXword,
}

// 按分组逐条产出重定位条目；addend 只解码不保留
pub(super) struct PackedRelocIterator<'a> {
    decoder: Sleb128Decoder<'a>,
    remaining: usize,
    group_left: usize,
    group_flags: usize,
    group_r_offset_delta: usize,
    r_offset: usize,
    r_info: usize,
    is_use_rela: bool,
}

impl<'a> PackedRelocIterator<'a> {
    const GROUPED_BY_INFO: usize = 1;
    const GROUPED_BY_OFFSET_DELTA: usize = 2;
    const GROUPED_BY_ADDEND: usize = 4;
    const GROUP_HAS_ADDEND: usize = 8;

    // data 不含 "APS2" 头
    pub(super) fn new(data: &'a [u8], is_use_rela: bool) -> Result<Self, Errno> {
        let mut decoder = Sleb128Decoder::new(data);
        let remaining = decoder.next()?;
        let r_offset = decoder.next()?;
        Ok(Self {
            decoder,
            remaining,
            group_left: 0,
            group_flags: 0,
            group_r_offset_delta: 0,
            r_offset,
            r_info: 0,
            is_use_rela,
        })
    }

    fn has_flag(&self, flag: usize) -> bool {
        self.group_flags & flag != 0
    }

    fn read_group_fields(&mut self) -> Result<(), Errno> {
        self.group_left = self.decoder.next()?;
        self.group_flags = self.decoder.next()?;
        if self.group_left == 0 {
            return Err(Errno::Format);
        }

        if self.has_flag(Self::GROUPED_BY_OFFSET_DELTA) {
            self.group_r_offset_delta = self.decoder.next()?;
        }
        if self.has_flag(Self::GROUPED_BY_INFO) {
            self.r_info = self.decoder.next()?;
        }
        if self.has_flag(Self::GROUP_HAS_ADDEND) && self.has_flag(Self::GROUPED_BY_ADDEND) {
            if !self.is_use_rela {
                log::error(format_args!("unexpected r_addend in android.rel section"));
                return Err(Errno::Format);
            }
            self.decoder.next()?;
        }
        Ok(())
    }

    pub(super) fn next(&mut self) -> Result<Option<PackedReloc>, Errno> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.group_left == 0 {
            self.read_group_fields()?;
        }

        let delta = if self.has_flag(Self::GROUPED_BY_OFFSET_DELTA) {
            self.group_r_offset_delta
        } else {
            self.decoder.next()?
        };
        self.r_offset = self.r_offset.wrapping_add(delta);

        if !self.has_flag(Self::GROUPED_BY_INFO) {
            self.r_info = self.decoder.next()?;
        }
        if self.has_flag(Self::GROUP_HAS_ADDEND) && !self.has_flag(Self::GROUPED_BY_ADDEND) {
            if !self.is_use_rela {
                return Err(Errno::Format);
            }
            self.decoder.next()?;
        }

        self.remaining -= 1;
        self.group_left -= 1;
        Ok(Some(PackedReloc {
            r_offset: self.r_offset,
            r_info: self.r_info as ElfXword,
        }))
    }
}
