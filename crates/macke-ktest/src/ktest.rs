//! KLEE's `.ktest` container.
//!
//! ```text
//! magic "KTEST" (or legacy "BOUT\n") | version u32
//! num_args u32 | [len u32 | bytes]
//! (version >= 2) sym_argvs u32 | sym_argv_len u32
//! num_objects u32 | [name_len u32 | name | num_bytes u32 | bytes]
//! ```
//!
//! All integers are big-endian.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const KTEST_MAGIC: &[u8; 5] = b"KTEST";
pub const BOUT_MAGIC: &[u8; 5] = b"BOUT\n";
pub const KTEST_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KTestObject {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KTest {
    pub version: u32,
    pub args: Vec<String>,
    pub sym_argvs: u32,
    pub sym_argv_len: u32,
    pub objects: Vec<KTestObject>,
}

impl KTest {
    pub fn new(objects: Vec<KTestObject>) -> Self {
        Self {
            version: KTEST_VERSION,
            args: Vec::new(),
            sym_argvs: 0,
            sym_argv_len: 0,
            objects,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, KTestError> {
        let data = std::fs::read(path).map_err(|source| KTestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, KTestError> {
        let mut reader = Reader::new(data);
        let magic = reader.take(5, "magic")?;
        if magic != KTEST_MAGIC && magic != BOUT_MAGIC {
            return Err(KTestError::BadMagic);
        }

        let version = reader.u32("version")?;
        if version > KTEST_VERSION {
            return Err(KTestError::UnsupportedVersion(version));
        }

        let num_args = reader.u32("argument count")?;
        let mut args = Vec::new();
        for _ in 0..num_args {
            args.push(reader.string("argument")?);
        }

        let (sym_argvs, sym_argv_len) = if version >= 2 {
            (reader.u32("sym_argvs")?, reader.u32("sym_argv_len")?)
        } else {
            (0, 0)
        };

        let num_objects = reader.u32("object count")?;
        let mut objects = Vec::new();
        for _ in 0..num_objects {
            let name = reader.string("object name")?;
            let len = reader.u32("object size")? as usize;
            let bytes = reader.take(len, "object bytes")?.to_vec();
            objects.push(KTestObject { name, bytes });
        }

        Ok(Self {
            version,
            args,
            sym_argvs,
            sym_argv_len,
            objects,
        })
    }

    /// Serializes in the current format version.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(KTEST_MAGIC);
        out.extend_from_slice(&KTEST_VERSION.to_be_bytes());
        out.extend_from_slice(&(self.args.len() as u32).to_be_bytes());
        for arg in &self.args {
            write_bytes(&mut out, arg.as_bytes());
        }
        out.extend_from_slice(&self.sym_argvs.to_be_bytes());
        out.extend_from_slice(&self.sym_argv_len.to_be_bytes());
        out.extend_from_slice(&(self.objects.len() as u32).to_be_bytes());
        for object in &self.objects {
            write_bytes(&mut out, object.name.as_bytes());
            write_bytes(&mut out, &object.bytes);
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<(), KTestError> {
        std::fs::write(path, self.to_bytes()).map_err(|source| KTestError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], KTestError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(KTestError::Truncated { what })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, KTestError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self, what: &'static str) -> Result<String, KTestError> {
        let len = self.u32(what)? as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| KTestError::InvalidUtf8 { what })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KTestError {
    #[error("I/O error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a ktest file (bad magic)")]
    BadMagic,
    #[error("unsupported ktest version {0} (newest supported is 3)")]
    UnsupportedVersion(u32),
    #[error("ktest data truncated while reading {what}")]
    Truncated { what: &'static str },
    #[error("{what} is not valid UTF-8")]
    InvalidUtf8 { what: &'static str },
}
