//! The channel report handed to downstream I/O generators.
//!
//! Describes every input and output channel of the compiled program:
//! the shim generators use `size` to size one transfer and `is_stream`
//! to decide whether the host drives a periodic loop. Serialization to
//! disk is the caller's concern.

use crate::frontend::types::{Dim, PrimType};
use crate::polyhedral::model::Model;
use serde::{Deserialize, Serialize};

/// One input or output channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub is_stream: bool,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Finite extents of the channel value.
    pub dimensions: Vec<i64>,
    /// Elements transferred per call: one period's worth for streams,
    /// the whole value otherwise.
    pub size: i64,
    /// Stream elements produced per period; 0 for finite channels.
    pub period_count: i64,
}

/// The report describing a compiled program's I/O surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub namespace: String,
    pub inputs: Vec<Channel>,
    pub outputs: Vec<Channel>,
}

/// The report vocabulary for an element type.
pub fn type_name(prim: PrimType) -> &'static str {
    match prim {
        PrimType::Bool => "bool",
        PrimType::Int => "integer",
        PrimType::Real32 => "real32",
        PrimType::Real64 => "real64",
    }
}

fn channel_for(model: &Model, array_id: crate::polyhedral::model::ArrayId) -> Channel {
    let array = model.array(array_id);
    let dimensions: Vec<i64> = array
        .size
        .iter()
        .filter_map(Dim::extent)
        .collect();
    let finite_volume: i64 = dimensions.iter().product::<i64>().max(1);

    let (is_stream, period_count) = if array.is_infinite {
        let period = array
            .producer
            .map(|p| model.statement(p).steady_count)
            .unwrap_or(1);
        (true, period)
    } else {
        (false, 0)
    };

    let size = if is_stream { finite_volume * period_count } else { finite_volume };

    Channel {
        name: array.name.clone(),
        is_stream,
        type_name: type_name(array.ty).to_string(),
        dimensions,
        size,
        period_count,
    }
}

/// Build the report for an analyzed model.
pub fn build(model: &Model, namespace: &str) -> Report {
    let inputs = model
        .input_arrays()
        .into_iter()
        .map(|id| channel_for(model, id))
        .collect();
    let outputs = model
        .output_array()
        .into_iter()
        .map(|id| channel_for(model, id))
        .collect();
    Report { namespace: namespace.to_string(), inputs, outputs }
}
