//! NumPy `.npy` 形式の読み書き
//!
//! 対応範囲:
//! - フォーマット v1.0 / v2.0 / v3.0
//! - dtype `f2 f4 f8 i4 i8 u1 b1`（リトル／ビッグエンディアン）
//! - C order（1次元以下なら Fortran order も可）
//! - `.npy.gz` は透過的に展開
//!
//! 書き出しは常に `<f8` の v1.0。

use std::io::{Read, Write};
use std::path::Path;
use std::sync::LazyLock;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use regex::Regex;

use crate::array::{PredictionArray, Precision};
use crate::error::{EnsembleError, Result};
use crate::io::{open_reader, write_atomic};

const MAGIC: &[u8; 6] = b"\x93NUMPY";
/// ヘッダ全体（magic から改行まで）の整列単位
const HEADER_ALIGN: usize = 64;

static DESCR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'descr'\s*:\s*'([^']+)'").expect("static regex"));
static FORTRAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'fortran_order'\s*:\s*(True|False)").expect("static regex"));
static SHAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'shape'\s*:\s*\(([^)]*)\)").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    F16,
    F32,
    F64,
    I32,
    I64,
    U8,
    Bool,
}

impl Kind {
    fn size(self) -> usize {
        match self {
            Kind::F16 => 2,
            Kind::F32 | Kind::I32 => 4,
            Kind::F64 | Kind::I64 => 8,
            Kind::U8 | Kind::Bool => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dtype {
    endian: Endian,
    kind: Kind,
}

fn parse_descr(descr: &str) -> Option<Dtype> {
    let mut chars = descr.chars();
    let order = chars.next()?;
    let endian = match order {
        '<' | '|' | '=' => Endian::Little,
        '>' => Endian::Big,
        _ => return None,
    };
    let kind = match chars.as_str() {
        "f2" => Kind::F16,
        "f4" => Kind::F32,
        "f8" => Kind::F64,
        "i4" => Kind::I32,
        "i8" => Kind::I64,
        "u1" => Kind::U8,
        "b1" => Kind::Bool,
        _ => return None,
    };
    Some(Dtype { endian, kind })
}

#[derive(Debug)]
struct Header {
    dtype: Dtype,
    fortran_order: bool,
    shape: Vec<usize>,
}

fn parse_header(text: &str) -> std::result::Result<Header, String> {
    let descr = DESCR_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .ok_or_else(|| "missing 'descr'".to_string())?
        .as_str();
    let dtype = parse_descr(descr).ok_or_else(|| format!("unsupported dtype '{descr}'"))?;
    let fortran_order = FORTRAN_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str() == "True")
        .ok_or_else(|| "missing 'fortran_order'".to_string())?;
    let shape_src = SHAPE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .ok_or_else(|| "missing 'shape'".to_string())?
        .as_str();
    let shape = shape_src
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches('L').parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("bad shape '({shape_src})': {e}"))?;
    Ok(Header {
        dtype,
        fortran_order,
        shape,
    })
}

fn decode<B: ByteOrder>(kind: Kind, raw: &[u8], out: &mut Vec<f64>) {
    let step = kind.size();
    for chunk in raw.chunks_exact(step) {
        let v = match kind {
            Kind::F16 => half::f16::from_bits(B::read_u16(chunk)).to_f64(),
            Kind::F32 => B::read_f32(chunk) as f64,
            Kind::F64 => B::read_f64(chunk),
            Kind::I32 => B::read_i32(chunk) as f64,
            Kind::I64 => B::read_i64(chunk) as f64,
            Kind::U8 => chunk[0] as f64,
            Kind::Bool => {
                if chunk[0] != 0 {
                    1.0
                } else {
                    0.0
                }
            }
        };
        out.push(v);
    }
}

/// バイト列から配列を復元する。`origin` はエラーメッセージ用
pub fn decode_npy(bytes: &[u8], origin: &str) -> Result<PredictionArray> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(EnsembleError::npy(origin, "not an npy file (bad magic)"));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (LittleEndian::read_u16(&bytes[8..10]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(EnsembleError::npy(origin, "truncated header"));
            }
            (LittleEndian::read_u32(&bytes[8..12]) as usize, 12)
        }
        v => return Err(EnsembleError::npy(origin, format!("unsupported format version {v}"))),
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(EnsembleError::npy(origin, "truncated header"));
    }
    let text = String::from_utf8_lossy(&bytes[header_start..data_start]);
    let header = parse_header(&text).map_err(|reason| EnsembleError::npy(origin, reason))?;
    if header.fortran_order && header.shape.len() > 1 {
        return Err(EnsembleError::npy(origin, "fortran order is not supported"));
    }

    let count: usize = header.shape.iter().product();
    let needed = count * header.dtype.kind.size();
    let raw = &bytes[data_start..];
    if raw.len() < needed {
        return Err(EnsembleError::npy(
            origin,
            format!("expected {needed} data bytes, found {}", raw.len()),
        ));
    }
    let mut data = Vec::with_capacity(count);
    match header.dtype.endian {
        Endian::Little => decode::<LittleEndian>(header.dtype.kind, &raw[..needed], &mut data),
        Endian::Big => decode::<BigEndian>(header.dtype.kind, &raw[..needed], &mut data),
    }
    PredictionArray::new(header.shape, data)
}

/// `.npy` / `.npy.gz` を読み、`precision` で丸める
pub fn read_npy(path: &Path, precision: Precision) -> Result<PredictionArray> {
    let mut reader = open_reader(path)?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let mut array = decode_npy(&bytes, &path.display().to_string())?;
    precision.apply(array.data_mut());
    Ok(array)
}

fn shape_literal(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [n] => format!("({n},)"),
        dims => {
            let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    }
}

/// `<f8` v1.0 のバイト列を作る
pub fn encode_npy(array: &PredictionArray) -> Vec<u8> {
    let dict = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}",
        shape_literal(array.shape())
    );
    // magic(6) + version(2) + len(2) + dict + padding + '\n'
    let unpadded = 10 + dict.len() + 1;
    let pad = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    let header_len = dict.len() + pad + 1;

    let mut out = Vec::with_capacity(10 + header_len + array.nbytes());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    let mut len_buf = [0u8; 2];
    LittleEndian::write_u16(&mut len_buf, header_len as u16);
    out.extend_from_slice(&len_buf);
    out.extend_from_slice(dict.as_bytes());
    out.extend(std::iter::repeat_n(b' ', pad));
    out.push(b'\n');
    let mut buf = [0u8; 8];
    for &v in array.data() {
        LittleEndian::write_f64(&mut buf, v);
        out.extend_from_slice(&buf);
    }
    out
}

/// 配列を書き出す（拡張子 `.gz` なら圧縮）。置き換えはアトミック
pub fn write_npy(path: &Path, array: &PredictionArray) -> Result<()> {
    let bytes = encode_npy(array);
    write_atomic(path, |w| w.write_all(&bytes))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// 任意の dtype/ヘッダでテスト用バイト列を組み立てる
    fn raw_npy(major: u8, descr: &str, fortran: bool, shape: &str, payload: &[u8]) -> Vec<u8> {
        let dict = format!(
            "{{'descr': '{descr}', 'fortran_order': {}, 'shape': {shape}, }}\n",
            if fortran { "True" } else { "False" }
        );
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&[major, 0]);
        if major == 1 {
            out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
        } else {
            out.extend_from_slice(&(dict.len() as u32).to_le_bytes());
        }
        out.extend_from_slice(dict.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_header_is_aligned() {
        let a = PredictionArray::new(vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let bytes = encode_npy(&a);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % HEADER_ALIGN, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
        assert_eq!(decode_npy(&bytes, "mem").unwrap(), a);
    }

    #[test]
    fn test_decode_float32_and_int_dtypes() {
        let f32s: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let a = decode_npy(&raw_npy(1, "<f4", false, "(2,)", &f32s), "mem").unwrap();
        assert_eq!(a.data(), &[1.5, -2.0]);

        let i64s: Vec<u8> = [7i64, -3].iter().flat_map(|v| v.to_be_bytes()).collect();
        let a = decode_npy(&raw_npy(2, ">i8", false, "(2,)", &i64s), "mem").unwrap();
        assert_eq!(a.data(), &[7.0, -3.0]);

        let a = decode_npy(&raw_npy(3, "|b1", false, "(3,)", &[1, 0, 1]), "mem").unwrap();
        assert_eq!(a.data(), &[1.0, 0.0, 1.0]);

        let halfs: Vec<u8> =
            [half::f16::from_f64(0.5).to_bits()].iter().flat_map(|v| v.to_le_bytes()).collect();
        let a = decode_npy(&raw_npy(1, "<f2", false, "(1,)", &halfs), "mem").unwrap();
        assert_eq!(a.data(), &[0.5]);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode_npy(b"PK\x03\x04not npy", "mem").is_err());
        assert!(decode_npy(&raw_npy(1, "<c16", false, "(1,)", &[0; 16]), "mem").is_err());
        // データ不足
        assert!(decode_npy(&raw_npy(1, "<f8", false, "(4,)", &[0; 8]), "mem").is_err());
        // 2次元の Fortran order
        assert!(decode_npy(&raw_npy(1, "<f8", true, "(1, 1)", &[0; 8]), "mem").is_err());
    }

    #[test]
    fn test_read_gz_with_precision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.npy.gz");
        let a = PredictionArray::from_vec(vec![0.1, 0.25, 3.0]);
        write_npy(&path, &a).unwrap();

        let exact = read_npy(&path, Precision::Double).unwrap();
        assert_eq!(exact, a);
        let single = read_npy(&path, Precision::Single).unwrap();
        assert_eq!(single.data()[0], 0.1f32 as f64);
        assert_eq!(single.data()[1], 0.25);
    }

    #[test]
    fn test_scalar_shape() {
        let a = PredictionArray::new(vec![], vec![4.0]).unwrap();
        let b = decode_npy(&encode_npy(&a), "mem").unwrap();
        assert_eq!(b.shape(), &[] as &[usize]);
        assert_eq!(b.data(), &[4.0]);
    }
}
