//! Single-file tensor container in the SafeTensors layout
//!
//! ```text
//! [8 bytes] header_size (little-endian u64)
//! [header_size bytes] JSON header:
//!   - "__metadata__": string -> string map
//!   - "<tensor_name>": { "dtype": "F32", "shape": [..], "data_offsets": [start, end] }
//! [remaining bytes] little-endian f32 data
//! ```
//!
//! Tensors are held on the host; decoding validates every offset so a
//! truncated or garbled file is reported instead of misread.

use std::collections::BTreeMap;
use std::io::Write;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use serde_json::{Map, Value, json};

/// Host copy of one f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl HostTensor {
    pub fn from_tensor<R: Runtime>(tensor: &Tensor<R>) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            data: tensor.contiguous().to_vec::<f32>(),
        }
    }

    pub fn to_tensor<R: Runtime<DType = DType>>(&self, device: &R::Device) -> Tensor<R> {
        Tensor::<R>::from_slice(&self.data, &self.shape, device)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    tensors: BTreeMap<String, HostTensor>,
    metadata: BTreeMap<String, String>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: HostTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.tensors.get(name)
    }

    /// Tensor names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Serialize to `out`. Tensors are laid out in name order.
    pub fn write_to<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        let mut header = Map::new();
        header.insert("__metadata__".into(), json!(self.metadata));

        let mut offset = 0usize;
        for (name, tensor) in &self.tensors {
            let byte_len = tensor.data.len() * 4;
            header.insert(
                name.clone(),
                json!({
                    "dtype": "F32",
                    "shape": tensor.shape,
                    "data_offsets": [offset, offset + byte_len],
                }),
            );
            offset += byte_len;
        }
        let header_bytes = serde_json::to_vec(&Value::Object(header))?;

        out.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
        out.write_all(&header_bytes)?;
        for tensor in self.tensors.values() {
            let bytes: Vec<u8> = tensor.data.iter().flat_map(|v| v.to_le_bytes()).collect();
            out.write_all(&bytes)?;
        }
        out.flush()
    }

    /// Decode a whole file image. The error string says what is wrong.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let size_bytes: [u8; 8] = bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| format!("file is {} bytes, shorter than the size prefix", bytes.len()))?;
        let header_size = u64::from_le_bytes(size_bytes) as usize;
        let data_start = 8usize
            .checked_add(header_size)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| format!("header size {header_size} exceeds file size {}", bytes.len()))?;

        let header: Value = serde_json::from_slice(&bytes[8..data_start])
            .map_err(|e| format!("header is not valid JSON: {e}"))?;
        let header = header
            .as_object()
            .ok_or_else(|| "header is not a JSON object".to_string())?;
        let data = &bytes[data_start..];

        let mut container = Container::new();
        for (key, value) in header {
            if key == "__metadata__" {
                let meta = value
                    .as_object()
                    .ok_or_else(|| "__metadata__ is not an object".to_string())?;
                for (mk, mv) in meta {
                    let s = mv
                        .as_str()
                        .ok_or_else(|| format!("metadata '{mk}' is not a string"))?;
                    container.set_metadata(mk.clone(), s);
                }
                continue;
            }
            container.insert(key.clone(), decode_entry(key, value, data)?);
        }
        Ok(container)
    }
}

fn decode_entry(key: &str, value: &Value, data: &[u8]) -> Result<HostTensor, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("tensor '{key}' is not an object"))?;

    match obj.get("dtype").and_then(Value::as_str) {
        Some("F32") => {}
        Some(other) => return Err(format!("tensor '{key}' has unsupported dtype {other}")),
        None => return Err(format!("tensor '{key}' missing dtype")),
    }

    let shape = obj
        .get("shape")
        .and_then(Value::as_array)
        .ok_or_else(|| format!("tensor '{key}' missing shape"))?
        .iter()
        .map(|v| v.as_u64().map(|n| n as usize))
        .collect::<Option<Vec<usize>>>()
        .ok_or_else(|| format!("tensor '{key}' has a non-integer dimension"))?;

    let offsets = obj
        .get("data_offsets")
        .and_then(Value::as_array)
        .filter(|a| a.len() == 2)
        .ok_or_else(|| format!("tensor '{key}' needs two data_offsets"))?;
    let (start, end) = match (offsets[0].as_u64(), offsets[1].as_u64()) {
        (Some(s), Some(e)) => (s as usize, e as usize),
        _ => return Err(format!("tensor '{key}' has non-integer data_offsets")),
    };

    let numel: usize = shape.iter().product();
    if end < start || end - start != numel * 4 {
        return Err(format!(
            "tensor '{key}' spans {start}..{end} but shape {shape:?} needs {} bytes",
            numel * 4
        ));
    }
    let raw = data
        .get(start..end)
        .ok_or_else(|| format!("tensor '{key}' runs past end of file (truncated?)"))?;

    Ok(HostTensor {
        shape,
        data: raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    })
}
