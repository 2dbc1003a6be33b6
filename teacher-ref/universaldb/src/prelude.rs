pub use crate::{
	key_selector::KeySelector,
	options::{ConflictRangeType, MutationType, StreamingMode},
	range_option::RangeOption,
	tuple::{PackError, PackResult, TupleDepth, TuplePack, TupleUnpack, VersionstampOffset},
	utils::{FormalChunkedKey, FormalKey, IsolationLevel::*, OptSliceExt, SliceExt, keys::*},
	value::Value,
};
