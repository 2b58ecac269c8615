use prost::Message;

use super::pprof;
use crate::profile::{Profile, SAMPLE_TYPE, SAMPLE_UNIT, THREAD_ID_LABEL, THREAD_NAME_LABEL};

pub struct ProfileSerializer;

impl ProfileSerializer {
    pub fn serialize(source: &Profile) -> Vec<u8> {
        Self::to_message(source).encode_to_vec()
    }

    pub fn to_message(source: &Profile) -> pprof::Profile {
        // Every id below was interned at construction, so the fallback is unreachable
        let string_index = |s: &str| source.string_id(s).unwrap_or(0) as i64;
        let wall_time = pprof::ValueType {
            r#type: string_index(SAMPLE_TYPE),
            unit: string_index(SAMPLE_UNIT),
        };
        let thread_id_key = string_index(THREAD_ID_LABEL);
        let thread_name_key = string_index(THREAD_NAME_LABEL);

        let samples = source
            .samples()
            .iter()
            .map(|sample| {
                let mut labels = vec![pprof::Label {
                    key: thread_id_key,
                    num: i64::from(sample.thread_id),
                    ..Default::default()
                }];
                if let Some(name) = sample.thread_name {
                    labels.push(pprof::Label {
                        key: thread_name_key,
                        str: name as i64,
                        ..Default::default()
                    });
                }
                pprof::Sample {
                    location_ids: sample.location_ids.clone(),
                    values: vec![sample.value],
                    labels,
                }
            })
            .collect();

        let mappings = source
            .mappings()
            .iter()
            .map(|mapping| pprof::Mapping {
                id: mapping.id,
                memory_start: mapping.memory_start,
                filename: mapping.filename as i64,
                build_id: mapping.build_id as i64,
                ..Default::default()
            })
            .collect();

        let locations = source
            .locations()
            .iter()
            .map(|location| pprof::Location {
                id: location.id,
                mapping_id: location.mapping_id,
                address: location.address,
                ..Default::default()
            })
            .collect();

        pprof::Profile {
            sample_types: vec![wall_time],
            samples,
            mappings,
            locations,
            string_table: source.strings().to_vec(),
            time_nanos: source.start_timestamp().unwrap_or(0) as i64,
            duration_nanos: source.duration_ns() as i64,
            period_type: Some(wall_time),
            period: source.sampling_interval_ns() as i64,
            ..Default::default()
        }
    }
}
