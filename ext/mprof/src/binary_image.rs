//! Resolution of instruction pointers to the loaded binary image containing them.

use std::fmt;

use crate::safe_read::{read_c_string, MemoryReader, SafeMemoryReader};
use crate::stack_trace::StackTrace;

pub const MIN_USERSPACE_ADDR: u64 = 0x1000;
pub const MAX_USERSPACE_ADDR: u64 = 0xFFFF_FFFF_F000;

const MAX_PATH_LEN: usize = 4096;

pub fn is_valid_userspace_addr(addr: u64) -> bool {
    (MIN_USERSPACE_ADDR..=MAX_USERSPACE_ADDR).contains(&addr)
}

/// 16-byte image identifier. GNU build ids longer than that are truncated,
/// shorter ones are zero-padded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BuildId(pub [u8; 16]);

impl BuildId {
    pub fn from_note(desc: &[u8]) -> Self {
        let mut id = [0u8; 16];
        let len = desc.len().min(16);
        id[..len].copy_from_slice(&desc[..len]);
        Self(id)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

// Rendered as an uppercase UUID, the form symbol servers index by.
impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// A default-constructed image is the "unresolved" sentinel: zero load address,
/// zero build id and no filename.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryImage {
    pub load_address: u64,
    pub build_id: BuildId,
    pub filename: Option<String>,
}

impl BinaryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.load_address != 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn lookup_pc(&mut self, pc: u64) -> bool {
        self.reset();
        if !is_valid_userspace_addr(pc) {
            return false;
        }
        match platform::loaded_images()
            .iter()
            .find(|image| image.contains(pc))
        {
            Some(image) => {
                image.fill(self);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub start: u64,
    pub end: u64,
    pub load_address: u64,
    pub build_id: BuildId,
    pub path: Option<String>,
}

impl LoadedImage {
    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }

    fn fill(&self, image: &mut BinaryImage) {
        image.load_address = self.load_address;
        image.build_id = self.build_id;
        image.filename = self.path.clone();
    }
}

/// Cached view of the loaded images, refreshed when a lookup misses or the
/// loader reports that images were added or removed.
///
/// Only touched from the sampling thread after the sampled thread has been
/// resumed, since walking the loader list may take the loader lock.
#[derive(Debug, Default)]
pub struct ImageCache {
    images: Vec<LoadedImage>,
    refreshed: bool,
    generation: Option<LoaderGeneration>,
}

pub type LoaderGeneration = (u64, u64);

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn refresh(&mut self) {
        let mut images = platform::loaded_images();
        images.sort_by_key(|image| image.start);
        log::trace!("Image cache refreshed ({} images)", images.len());
        self.images = images;
        self.refreshed = true;
    }

    // A snapshot from another loader generation may map an address range to
    // an image that was unloaded since. Without a generation the snapshot is
    // dropped every time.
    fn observe_generation(&mut self, current: Option<LoaderGeneration>) {
        if current.is_none() || current != self.generation {
            self.images.clear();
            self.generation = current;
        }
    }

    fn find(&self, pc: u64) -> Option<&LoadedImage> {
        let index = self.images.partition_point(|image| image.start <= pc);
        let candidate = self.images.get(index.checked_sub(1)?)?;
        candidate.contains(pc).then_some(candidate)
    }

    fn lookup_batched(&mut self, pc: u64, image: &mut BinaryImage) -> bool {
        image.reset();
        if !is_valid_userspace_addr(pc) {
            return false;
        }
        if self.find(pc).is_none() && !self.refreshed {
            self.refresh();
        }
        match self.find(pc) {
            Some(found) => {
                found.fill(image);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&mut self, pc: u64, image: &mut BinaryImage) -> bool {
        self.refreshed = false;
        self.observe_generation(platform::loader_generation());
        self.lookup_batched(pc, image)
    }

    /// Resolves every frame of a batch. The snapshot is refreshed at most once
    /// per batch so garbage addresses don't trigger a walk each.
    pub fn resolve_frames(&mut self, traces: &mut [StackTrace]) {
        self.refreshed = false;
        self.observe_generation(platform::loader_generation());
        let mut unresolved = 0usize;
        for trace in traces.iter_mut() {
            for frame in trace.frames.iter_mut() {
                if !self.lookup_batched(frame.instruction_pointer, &mut frame.image) {
                    unresolved += 1;
                }
            }
        }
        if unresolved > 0 {
            log::trace!("{} frames left unresolved", unresolved);
        }
    }
}

// Walks a PT_NOTE segment looking for the GNU build id.
fn find_gnu_build_id<R: MemoryReader>(reader: &R, start: u64, size: u64) -> Option<BuildId> {
    const NT_GNU_BUILD_ID: u32 = 3;
    const NOTE_HEADER_SIZE: u64 = 12;
    const MAX_NOTES: usize = 64;

    let align4 = |n: u64| (n + 3) & !3;
    let end = start.checked_add(size)?;
    let mut cursor = start;

    for _ in 0..MAX_NOTES {
        if cursor.checked_add(NOTE_HEADER_SIZE)? > end {
            return None;
        }
        let namesz = u64::from(reader.read_u32(cursor)?);
        let descsz = u64::from(reader.read_u32(cursor + 4)?);
        let note_type = reader.read_u32(cursor + 8)?;
        let name_at = cursor + NOTE_HEADER_SIZE;
        let desc_at = name_at.checked_add(align4(namesz))?;
        let next = desc_at.checked_add(align4(descsz))?;
        if next > end {
            return None;
        }

        if note_type == NT_GNU_BUILD_ID && namesz == 4 {
            let mut name = [0u8; 4];
            if reader.read_bytes(name_at, &mut name) && &name == b"GNU\0" {
                let mut desc = [0u8; 16];
                let len = descsz.min(16) as usize;
                if reader.read_bytes(desc_at, &mut desc[..len]) {
                    return Some(BuildId::from_note(&desc[..len]));
                }
                return None;
            }
        }
        cursor = next;
    }
    None
}

#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl ProgramHeader {
    const SIZE: usize = 56;
    const PT_LOAD: u32 = 1;
    const PT_NOTE: u32 = 4;

    // Elf64_Phdr layout: p_type, p_flags, p_offset, p_vaddr, p_paddr, p_filesz, p_memsz, p_align.
    fn read<R: MemoryReader>(reader: &R, addr: u64) -> Option<Self> {
        let mut raw = [0u8; Self::SIZE];
        if !reader.read_bytes(addr, &mut raw) {
            return None;
        }
        let word = |at: usize| u64::from_ne_bytes(raw[at..at + 8].try_into().unwrap_or([0; 8]));
        Some(Self {
            p_type: u32::from_ne_bytes(raw[0..4].try_into().unwrap_or([0; 4])),
            p_vaddr: word(16),
            p_filesz: word(32),
            p_memsz: word(40),
        })
    }
}

fn describe_image<R: MemoryReader>(
    reader: &R,
    bias: u64,
    phdr: u64,
    phnum: usize,
    path: Option<String>,
) -> Option<LoadedImage> {
    const PAGE_MASK: u64 = !0xFFF;

    let mut lowest_vaddr = u64::MAX;
    let mut highest_end = 0u64;
    let mut notes = Vec::new();

    for i in 0..phnum {
        let header = ProgramHeader::read(reader, phdr + (i * ProgramHeader::SIZE) as u64)?;
        match header.p_type {
            ProgramHeader::PT_LOAD => {
                lowest_vaddr = lowest_vaddr.min(header.p_vaddr & PAGE_MASK);
                highest_end = highest_end.max(header.p_vaddr.saturating_add(header.p_memsz));
            }
            ProgramHeader::PT_NOTE => notes.push(header),
            _ => {}
        }
    }
    if lowest_vaddr == u64::MAX {
        return None;
    }

    let build_id = notes
        .iter()
        .find_map(|note| find_gnu_build_id(reader, bias.wrapping_add(note.p_vaddr), note.p_filesz))
        .unwrap_or_default();

    Some(LoadedImage {
        start: bias.wrapping_add(lowest_vaddr),
        end: bias.wrapping_add(highest_end),
        load_address: bias.wrapping_add(lowest_vaddr),
        build_id,
        path,
    })
}

#[cfg(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64"))]
mod platform {
    use std::ffi::{c_int, c_void};
    use std::mem;
    use std::sync::OnceLock;

    use super::*;

    fn current_exe_path() -> Option<String> {
        static EXE: OnceLock<Option<String>> = OnceLock::new();
        EXE.get_or_init(|| {
            std::env::current_exe()
                .ok()
                .map(|path| path.to_string_lossy().into_owned())
        })
        .clone()
    }

    unsafe extern "C" fn collect_image(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let images = unsafe { &mut *(data as *mut Vec<LoadedImage>) };
        let info = unsafe { &*info };

        let reader = SafeMemoryReader;
        let path = read_c_string(&reader, info.dlpi_name as u64, MAX_PATH_LEN)
            .filter(|name| !name.is_empty())
            .or_else(current_exe_path);

        if let Some(image) = describe_image(
            &reader,
            info.dlpi_addr as u64,
            info.dlpi_phdr as u64,
            usize::from(info.dlpi_phnum),
            path,
        ) {
            images.push(image);
        }
        0
    }

    unsafe extern "C" fn read_generation(
        info: *mut libc::dl_phdr_info,
        size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        // Older loaders hand out a shorter struct without the counters
        if size < mem::offset_of!(libc::dl_phdr_info, dlpi_tls_modid) {
            return 1;
        }
        let generation = unsafe { &mut *(data as *mut Option<LoaderGeneration>) };
        let info = unsafe { &*info };
        *generation = Some((info.dlpi_adds, info.dlpi_subs));
        1
    }

    pub fn loader_generation() -> Option<LoaderGeneration> {
        let mut generation: Option<LoaderGeneration> = None;
        unsafe {
            libc::dl_iterate_phdr(
                Some(read_generation),
                &mut generation as *mut Option<LoaderGeneration> as *mut c_void,
            );
        }
        generation
    }

    pub fn loaded_images() -> Vec<LoadedImage> {
        let mut images: Vec<LoadedImage> = Vec::new();
        unsafe {
            libc::dl_iterate_phdr(
                Some(collect_image),
                &mut images as *mut Vec<LoadedImage> as *mut c_void,
            );
        }
        images
    }
}

#[cfg(not(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64")))]
mod platform {
    use super::{LoadedImage, LoaderGeneration};

    pub fn loader_generation() -> Option<LoaderGeneration> {
        None
    }

    pub fn loaded_images() -> Vec<LoadedImage> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeMemory(HashMap<u64, u8>);

    impl FakeMemory {
        fn new() -> Self {
            Self(HashMap::new())
        }

        fn write(&mut self, addr: u64, bytes: &[u8]) {
            for (i, b) in bytes.iter().enumerate() {
                self.0.insert(addr + i as u64, *b);
            }
        }
    }

    impl MemoryReader for FakeMemory {
        fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> bool {
            for (i, slot) in dst.iter_mut().enumerate() {
                match self.0.get(&(addr + i as u64)) {
                    Some(b) => *slot = *b,
                    None => return false,
                }
            }
            true
        }
    }

    fn note(name: &[u8], note_type: u32, desc: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_ne_bytes());
        out.extend_from_slice(&note_type.to_ne_bytes());
        out.extend_from_slice(name);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(desc);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn phdr(p_type: u32, vaddr: u64, filesz: u64, memsz: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&p_type.to_ne_bytes());
        out.extend_from_slice(&5u32.to_ne_bytes());
        out.extend_from_slice(&0u64.to_ne_bytes());
        out.extend_from_slice(&vaddr.to_ne_bytes());
        out.extend_from_slice(&vaddr.to_ne_bytes());
        out.extend_from_slice(&filesz.to_ne_bytes());
        out.extend_from_slice(&memsz.to_ne_bytes());
        out.extend_from_slice(&0x1000u64.to_ne_bytes());
        out
    }

    #[test]
    fn test_sentinel_state() {
        let image = BinaryImage::new();
        assert_eq!(image.load_address, 0);
        assert!(image.build_id.is_zero());
        assert_eq!(image.filename, None);
        assert!(!image.is_resolved());
    }

    #[test]
    fn test_rejects_bogus_addresses() {
        let mut image = BinaryImage::new();
        assert!(!image.lookup_pc(0));
        assert!(!image.lookup_pc(0x10));
        assert!(!image.lookup_pc(u64::MAX));
        assert_eq!(image, BinaryImage::new());
    }

    #[test]
    fn test_build_id_display() {
        let id = BuildId([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
            0x66, 0x77,
        ]);
        assert_eq!(id.to_string(), "01234567-89AB-CDEF-0011-223344556677");
    }

    #[test]
    fn test_build_id_truncates_and_pads() {
        let long: Vec<u8> = (1..=20).collect();
        assert_eq!(BuildId::from_note(&long).0[15], 16);
        let short = BuildId::from_note(&[0xAA, 0xBB]);
        assert_eq!(&short.0[..3], &[0xAA, 0xBB, 0x00]);
    }

    #[test]
    fn test_describe_image_from_program_headers() {
        let bias = 0x5555_0000_0000u64;
        let phdr_at = 0x10_0000u64;
        let note_vaddr = 0x2000u64;

        let mut memory = FakeMemory::new();
        let notes = [
            note(b"Go\0\0", 4, &[9; 8]),
            note(b"GNU\0", 3, &(0..20).collect::<Vec<u8>>()),
        ]
        .concat();
        let headers = [
            phdr(ProgramHeader::PT_LOAD, 0x0, 0x3000, 0x3000),
            phdr(ProgramHeader::PT_NOTE, note_vaddr, notes.len() as u64, notes.len() as u64),
            phdr(ProgramHeader::PT_LOAD, 0x4010, 0x100, 0x2000),
        ]
        .concat();
        memory.write(phdr_at, &headers);
        memory.write(bias + note_vaddr, &notes);

        let image =
            describe_image(&memory, bias, phdr_at, 3, Some("libfake.so".to_string())).unwrap();
        assert_eq!(image.load_address, bias);
        assert_eq!(image.start, bias);
        assert_eq!(image.end, bias + 0x6010);
        assert_eq!(image.build_id.0, {
            let mut id = [0u8; 16];
            for (i, b) in id.iter_mut().enumerate() {
                *b = i as u8;
            }
            id
        });
        assert!(image.contains(bias + 0x4500));
        assert!(!image.contains(bias + 0x6010));
    }

    #[test]
    fn test_describe_image_without_readable_notes() {
        let mut memory = FakeMemory::new();
        let headers = [
            phdr(ProgramHeader::PT_LOAD, 0x1000, 0x100, 0x100),
            phdr(ProgramHeader::PT_NOTE, 0x9000, 0x40, 0x40),
        ]
        .concat();
        memory.write(0x4000, &headers);

        let image = describe_image(&memory, 0x7000_0000, 0x4000, 2, None).unwrap();
        assert!(image.build_id.is_zero());
        assert_eq!(image.load_address, 0x7000_1000);
    }

    #[test]
    fn test_describe_image_with_unreadable_headers() {
        let memory = FakeMemory::new();
        assert_eq!(describe_image(&memory, 0, 0x4000, 2, None), None);
    }

    #[cfg(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64"))]
    #[test]
    fn test_lookup_pc_resolves_own_code() {
        let pc = test_lookup_pc_resolves_own_code as usize as u64;
        let mut image = BinaryImage::new();
        assert!(image.lookup_pc(pc));
        assert!(image.is_resolved());
        assert!(image.load_address <= pc);
        assert!(image.filename.is_some());

        image.reset();
        assert_eq!(image, BinaryImage::new());
    }

    #[cfg(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64"))]
    #[test]
    fn test_cache_matches_direct_lookup() {
        let pcs = [
            test_cache_matches_direct_lookup as usize as u64,
            libc::getpid as usize as u64,
        ];
        let mut cache = ImageCache::new();
        for pc in pcs {
            let mut direct = BinaryImage::new();
            let mut cached = BinaryImage::new();
            assert!(direct.lookup_pc(pc));
            assert!(cache.lookup(pc, &mut cached));
            assert_eq!(direct, cached);
        }
        assert!(!cache.is_empty());

        let mut missing = BinaryImage::new();
        assert!(!cache.lookup(0x20, &mut missing));
        assert_eq!(missing, BinaryImage::new());
    }

    fn loaded(start: u64, end: u64, id: u8) -> LoadedImage {
        LoadedImage {
            start,
            end,
            load_address: start,
            build_id: BuildId([id; 16]),
            path: Some(format!("lib{}.so", id)),
        }
    }

    #[test]
    fn test_snapshot_dropped_when_loader_generation_changes() {
        let mut cache = ImageCache::new();
        cache.observe_generation(Some((4, 1)));
        cache.images = vec![loaded(0x10_0000, 0x20_0000, 1)];

        cache.observe_generation(Some((4, 1)));
        assert_eq!(cache.len(), 1);
        assert!(cache.find(0x18_0000).is_some());

        // dlclose then dlopen at an overlapping range
        cache.observe_generation(Some((5, 2)));
        assert!(cache.is_empty());
        assert!(cache.find(0x18_0000).is_none());
    }

    #[test]
    fn test_snapshot_dropped_without_loader_generation() {
        let mut cache = ImageCache::new();
        cache.observe_generation(None);
        cache.images = vec![loaded(0x10_0000, 0x20_0000, 1)];
        cache.observe_generation(None);
        assert!(cache.is_empty());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_loader_generation_is_reported() {
        let (adds, subs) = platform::loader_generation().unwrap();
        assert!(adds >= 1);
        assert!(subs <= adds);
    }
}
