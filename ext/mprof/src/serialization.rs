pub mod pprof;
pub mod serializer;
