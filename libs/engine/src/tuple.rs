//! Flow-record tuple and its CSV line codec.
//!
//! The engine is monomorphized over a single tuple schema shaped after VAST
//! netflow records. Parsing stays here, at the edge of the system; everything
//! downstream works with typed [`FlowTuple`]s.

use serde::{Deserialize, Serialize};

/// A single flow record.
///
/// `time` is stream time in seconds; `duration` is the flow's lifetime, so
/// the flow ends at `time + duration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTuple {
    pub time: f64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub duration: f64,
    pub src_bytes: u64,
    pub dst_bytes: u64,
}

impl FlowTuple {
    /// Parse one CSV line:
    /// `time,src_ip,dst_ip,src_port,dst_port,protocol,duration,src_bytes,dst_bytes`
    pub fn parse_csv(line: &str) -> Result<Self, TupleParseError> {
        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() != 9 {
            return Err(TupleParseError(format!(
                "expected 9 fields, got {}",
                fields.len()
            )));
        }

        fn field<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, TupleParseError> {
            raw.parse()
                .map_err(|_| TupleParseError(format!("bad {} field: {:?}", name, raw)))
        }

        Ok(FlowTuple {
            time: field(fields[0], "time")?,
            src_ip: fields[1].to_string(),
            dst_ip: fields[2].to_string(),
            src_port: field(fields[3], "src_port")?,
            dst_port: field(fields[4], "dst_port")?,
            protocol: fields[5].to_string(),
            duration: field(fields[6], "duration")?,
            src_bytes: field(fields[7], "src_bytes")?,
            dst_bytes: field(fields[8], "dst_bytes")?,
        })
    }

    /// Emit the CSV form accepted by [`FlowTuple::parse_csv`].
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.time,
            self.src_ip,
            self.dst_ip,
            self.src_port,
            self.dst_port,
            self.protocol,
            self.duration,
            self.src_bytes,
            self.dst_bytes
        )
    }
}

/// Error for malformed flow-record lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleParseError(String);

impl std::fmt::Display for TupleParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid flow record: {}", self.0)
    }
}

impl std::error::Error for TupleParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_emit() {
        let line = "0.47,192.168.0.1,10.0.0.2,51482,80,tcp,1,1000,200";
        let tuple = FlowTuple::parse_csv(line).unwrap();
        assert_eq!(tuple.time, 0.47);
        assert_eq!(tuple.src_ip, "192.168.0.1");
        assert_eq!(tuple.dst_port, 80);
        assert_eq!(FlowTuple::parse_csv(&tuple.to_csv()).unwrap(), tuple);
    }

    #[test]
    fn rejects_short_lines() {
        assert!(FlowTuple::parse_csv("1.0,a,b").is_err());
    }

    #[test]
    fn rejects_bad_numbers() {
        let line = "abc,192.168.0.1,10.0.0.2,51482,80,tcp,1,1000,200";
        let err = FlowTuple::parse_csv(line).unwrap_err();
        assert!(err.to_string().contains("time"));
    }
}
