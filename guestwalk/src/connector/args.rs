use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

use core::convert::TryFrom;
use std::str::FromStr;

use hashbrown::HashMap;

/// Argument wrapper for connectors
///
/// # Examples
///
/// Construct from a string:
/// ```
/// use guestwalk::connector::ConnectorArgs;
/// use std::convert::TryFrom;
///
/// let argstr = "/tmp/guest.raw,ram_base=0x40000000";
/// let args = ConnectorArgs::try_from(argstr).unwrap();
/// assert_eq!(args.get_default().unwrap(), "/tmp/guest.raw");
/// ```
///
/// Construct as builder:
/// ```
/// use guestwalk::connector::ConnectorArgs;
///
/// let args = ConnectorArgs::new()
///     .insert("path", "/tmp/guest.raw")
///     .insert("ram_base", "0x40000000");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnectorArgs {
    map: HashMap<String, String>,
}

impl ConnectorArgs {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn with_default(value: &str) -> Self {
        Self::new().insert("default", value)
    }

    pub fn try_parse_str(args: &str) -> Result<Self> {
        let mut map = HashMap::new();

        for (i, kv) in args.split(',').enumerate() {
            let kvsplit = kv.split('=').collect::<Vec<_>>();
            if kvsplit.len() == 2 {
                map.insert(kvsplit[0].trim().to_string(), kvsplit[1].trim().to_string());
            } else if i == 0 && kvsplit.len() == 1 {
                if !kv.is_empty() {
                    map.insert("default".to_string(), kv.to_string());
                }
            } else {
                return Err(Error(ErrorOrigin::Args, ErrorKind::ArgValidation)
                    .log_error(format!("malformed argument: {}", kv)));
            }
        }

        Ok(Self { map })
    }

    pub fn insert(mut self, key: &str, value: &str) -> Self {
        self.map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.map.get(key)
    }

    pub fn get_default(&self) -> Option<&String> {
        self.get("default")
    }

    /// Parses the value of `key`, falls back to `default` when it is not set.
    pub fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            Some(value) => value.parse::<T>().map_err(|_| {
                Error(ErrorOrigin::Args, ErrorKind::ArgValidation)
                    .log_error(format!("invalid value for {}: {}", key, value))
            }),
            None => Ok(default),
        }
    }
}

impl TryFrom<&str> for ConnectorArgs {
    type Error = Error;

    fn try_from(args: &str) -> Result<Self> {
        ConnectorArgs::try_parse_str(args)
    }
}

impl FromStr for ConnectorArgs {
    type Err = Error;

    fn from_str(args: &str) -> Result<Self> {
        ConnectorArgs::try_parse_str(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhysicalAddress;

    #[test]
    pub fn from_str() {
        let argstr = "opt1=test1,opt2=test2,opt3=test3";
        let args = ConnectorArgs::try_from(argstr).unwrap();
        assert_eq!(args.get("opt1").unwrap(), "test1");
        assert_eq!(args.get("opt2").unwrap(), "test2");
        assert_eq!(args.get("opt3").unwrap(), "test3");
    }

    #[test]
    pub fn from_str_default() {
        let argstr = "test0,opt1=test1,opt2=test2";
        let args = ConnectorArgs::try_from(argstr).unwrap();
        assert_eq!(args.get_default().unwrap(), "test0");
        assert_eq!(args.get("opt1").unwrap(), "test1");
        assert_eq!(args.get("opt2").unwrap(), "test2");
    }

    #[test]
    pub fn from_str_default_not_first() {
        let argstr = "opt1=test1,test0";
        assert!(ConnectorArgs::try_from(argstr).is_err());
    }

    #[test]
    pub fn builder() {
        let args = ConnectorArgs::new()
            .insert("arg1", "test1")
            .insert("arg2", "test2");
        assert_eq!(args.get("arg1").unwrap(), "test1");
        assert_eq!(args.get("arg2").unwrap(), "test2");
    }

    #[test]
    pub fn parse_empty() {
        let args = ConnectorArgs::try_from("").unwrap();
        assert_eq!(args.get_default(), None);
    }

    #[test]
    pub fn parsed_values() {
        let args = ConnectorArgs::try_from("dump.raw,ram_base=0x4000_0000,size=zz").unwrap();
        assert_eq!(
            args.get_parsed("ram_base", PhysicalAddress::NULL).unwrap(),
            PhysicalAddress::from(0x4000_0000)
        );
        assert_eq!(args.get_parsed("missing", 7u64).unwrap(), 7);
        assert!(args.get_parsed("size", 0u64).is_err());
    }
}
