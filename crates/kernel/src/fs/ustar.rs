//! A minimal ustar reader, just enough to unpack the boot ramdisk.

const BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarEntryKind {
    Normal,
    Directory,
    Other,
}

pub struct TarEntry<'a> {
    name: &'a str,
    kind: TarEntryKind,
    data: &'a [u8],
}

impl<'a> TarEntry<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn kind(&self) -> TarEntryKind {
        self.kind
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

pub struct TarArchiveIter<'a> {
    archive: &'a [u8],
    offset: usize,
}

fn octal(field: &[u8]) -> usize {
    let mut value = 0;
    for byte in field {
        match byte {
            b'0'..=b'7' => value = value * 8 + (byte - b'0') as usize,
            _ => break,
        }
    }
    value
}

fn cstr(field: &[u8]) -> &str {
    let end = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

impl<'a> TarArchiveIter<'a> {
    /// # Safety
    /// `archive` must stay mapped for the iterator's lifetime.
    pub unsafe fn new(archive: *const u8, len: usize) -> Self {
        Self {
            archive: unsafe { core::slice::from_raw_parts(archive, len) },
            offset: 0,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<TarEntry<'a>> {
        loop {
            let header = self.archive.get(self.offset..self.offset + BLOCK_SIZE)?;
            if header[0] == 0 {
                // two zero blocks end the archive, one is enough to stop
                return None;
            }

            let size = octal(&header[124..136]);
            let kind = match header[156] {
                b'0' | 0 => TarEntryKind::Normal,
                b'5' => TarEntryKind::Directory,
                _ => TarEntryKind::Other,
            };
            let name = cstr(&header[0..100]);

            let data_start = self.offset + BLOCK_SIZE;
            let data = self.archive.get(data_start..data_start + size)?;

            self.offset = data_start + size.next_multiple_of(BLOCK_SIZE);

            // directory names come with a trailing slash
            let name = name.trim_end_matches('/');
            if name.is_empty() {
                continue;
            }

            return Some(TarEntry { name, kind, data });
        }
    }
}
