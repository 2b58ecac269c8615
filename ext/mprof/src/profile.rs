use std::collections::HashMap;

use crate::binary_image::{BinaryImage, BuildId};
use crate::stack_trace::StackTrace;

pub const SAMPLE_TYPE: &str = "wall-time";
pub const SAMPLE_UNIT: &str = "nanoseconds";
pub const THREAD_ID_LABEL: &str = "thread id";
pub const THREAD_NAME_LABEL: &str = "thread name";

/// Index into the string table. Index 0 is always the empty string.
pub type StringId = usize;
/// 1-based mapping id; 0 means "no mapping" (unresolved frame).
pub type MappingId = u64;
pub type LocationId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub id: MappingId,
    pub memory_start: u64,
    pub filename: StringId,
    pub build_id: StringId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub id: LocationId,
    pub mapping_id: MappingId,
    pub address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub thread_id: u32,
    pub thread_name: Option<StringId>,
    /// Innermost first.
    pub location_ids: Vec<LocationId>,
    pub value: i64,
}

#[derive(Debug, Clone)]
pub struct Profile {
    sampling_interval_ns: u64,
    strings: Vec<String>,
    string_ids: HashMap<String, StringId>,
    mappings: Vec<Mapping>,
    mapping_ids: HashMap<(u64, BuildId), MappingId>,
    locations: Vec<Location>,
    location_ids: HashMap<(MappingId, u64), LocationId>,
    samples: Vec<Sample>,
    sample_index: HashMap<(u32, Vec<LocationId>), usize>,
    start_timestamp: Option<u64>,
    end_timestamp: Option<u64>,
}

impl Profile {
    pub fn new(sampling_interval_ns: u64) -> Self {
        let mut profile = Self {
            sampling_interval_ns,
            strings: vec![],
            string_ids: HashMap::new(),
            mappings: vec![],
            mapping_ids: HashMap::new(),
            locations: vec![],
            location_ids: HashMap::new(),
            samples: vec![],
            sample_index: HashMap::new(),
            start_timestamp: None,
            end_timestamp: None,
        };
        for s in ["", SAMPLE_TYPE, SAMPLE_UNIT, THREAD_ID_LABEL, THREAD_NAME_LABEL] {
            profile.intern(s);
        }
        profile
    }

    pub fn sampling_interval_ns(&self) -> u64 {
        self.sampling_interval_ns
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn start_timestamp(&self) -> Option<u64> {
        self.start_timestamp
    }

    pub fn end_timestamp(&self) -> Option<u64> {
        self.end_timestamp
    }

    pub fn duration_ns(&self) -> u64 {
        match (self.start_timestamp, self.end_timestamp) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => 0,
        }
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(id) = self.string_ids.get(s) {
            return *id;
        }
        let id = self.strings.len();
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    pub fn string_id(&self, s: &str) -> Option<StringId> {
        self.string_ids.get(s).copied()
    }

    fn mapping_id_for(&mut self, image: &BinaryImage) -> MappingId {
        if !image.is_resolved() {
            return 0;
        }
        let key = (image.load_address, image.build_id);
        if let Some(id) = self.mapping_ids.get(&key) {
            return *id;
        }

        let filename = self.intern(image.filename.as_deref().unwrap_or(""));
        let build_id = if image.build_id.is_zero() {
            0
        } else {
            self.intern(&image.build_id.to_string())
        };
        let id = self.mappings.len() as MappingId + 1;
        self.mappings.push(Mapping {
            id,
            memory_start: image.load_address,
            filename,
            build_id,
        });
        self.mapping_ids.insert(key, id);
        id
    }

    fn location_id_for(&mut self, mapping_id: MappingId, address: u64) -> LocationId {
        *self
            .location_ids
            .entry((mapping_id, address))
            .or_insert_with(|| {
                let id = self.locations.len() as LocationId + 1;
                self.locations.push(Location {
                    id,
                    mapping_id,
                    address,
                });
                id
            })
    }

    /// Folds a batch of traces into the profile. Identical stacks on the same
    /// thread accumulate into one sample.
    pub fn add_samples(&mut self, traces: &[StackTrace]) {
        for trace in traces {
            if trace.frames.is_empty() {
                log::trace!("Skipping empty trace from thread {}", trace.thread_id);
                continue;
            }

            let location_ids: Vec<LocationId> = trace
                .frames
                .iter()
                .map(|frame| {
                    let mapping_id = self.mapping_id_for(&frame.image);
                    self.location_id_for(mapping_id, frame.instruction_pointer)
                })
                .collect();

            self.record_timestamp(trace.timestamp);

            let key = (trace.thread_id, location_ids);
            if let Some(index) = self.sample_index.get(&key) {
                let sample = &mut self.samples[*index];
                sample.value = sample.value.saturating_add(self.sampling_interval_ns as i64);
                continue;
            }

            let thread_name = trace.thread_name.as_deref().map(|name| self.intern(name));
            self.sample_index.insert(key.clone(), self.samples.len());
            self.samples.push(Sample {
                thread_id: key.0,
                thread_name,
                location_ids: key.1,
                value: self.sampling_interval_ns as i64,
            });
        }
    }

    fn record_timestamp(&mut self, timestamp: u64) {
        if timestamp == 0 {
            return;
        }
        self.start_timestamp = Some(self.start_timestamp.map_or(timestamp, |t| t.min(timestamp)));
        self.end_timestamp = Some(self.end_timestamp.map_or(timestamp, |t| t.max(timestamp)));
    }
}
