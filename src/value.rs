/// A single remote cell, decoupled from any particular wire client's value
/// type so the translator and planner can be unit-tested without a live
/// connection. `StandardDriver`/`ShardedDriver` convert `hdbconnect`'s
/// `HdbValue` into this on the way in.
#[derive(Debug, Clone, PartialEq)]
pub enum FedValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl FedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FedValue::Null)
    }

    /// Emits the value the way the query translator needs it on the wire
    /// (spec §4.E "Value encoding"): BIT as hex literal, BLOB/VARBINARY as a
    /// length-prefix-free quoted byte string with `'` doubled, strings
    /// single-quoted and escaped, numerics unquoted.
    pub fn to_sql_literal(&self) -> String {
        match self {
            FedValue::Null => "NULL".to_string(),
            FedValue::Bool(b) => {
                let mut hex = String::from("0x");
                hex.push_str(if *b { "01" } else { "00" });
                hex
            }
            FedValue::I64(i) => i.to_string(),
            FedValue::F64(f) => f.to_string(),
            FedValue::Str(s) => format!("'{}'", s.replace('\'', "''")),
            FedValue::Bytes(b) => {
                let escaped: String = b
                    .iter()
                    .map(|byte| *byte as char)
                    .collect::<String>()
                    .replace('\'', "''");
                format!("'{}'", escaped)
            }
        }
    }
}
