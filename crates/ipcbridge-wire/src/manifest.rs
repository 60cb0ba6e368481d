use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WireError};
use crate::message::MessageType;

/// How a method is called and how its result travels back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Sync,
    Async,
    Promise,
    Readable,
    Writable,
    Duplex,
}

impl CallType {
    pub const ALL: [CallType; 6] = [
        CallType::Sync,
        CallType::Async,
        CallType::Promise,
        CallType::Readable,
        CallType::Writable,
        CallType::Duplex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Sync => "sync",
            CallType::Async => "async",
            CallType::Promise => "promise",
            CallType::Readable => "readable",
            CallType::Writable => "writable",
            CallType::Duplex => "duplex",
        }
    }

    pub fn is_stream(self) -> bool {
        self.is_readable() || self.is_writable()
    }

    pub fn is_readable(self) -> bool {
        matches!(self, CallType::Readable | CallType::Duplex)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, CallType::Writable | CallType::Duplex)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = WireError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CallType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| WireError::InvalidCallType(s.to_string()))
    }
}

/// The shared mapping from method name to call type.
///
/// Both sides must be built from the same manifest. Iteration is in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    methods: BTreeMap<String, CallType>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Manifest::insert`].
    pub fn with(mut self, name: impl Into<String>, call_type: CallType) -> Self {
        self.methods.insert(name.into(), call_type);
        self
    }

    /// Add or replace a method. Returns the previous call type, if any.
    pub fn insert(&mut self, name: impl Into<String>, call_type: CallType) -> Option<CallType> {
        self.methods.insert(name.into(), call_type)
    }

    pub fn get(&self, name: &str) -> Option<CallType> {
        self.methods.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, CallType)> {
        self.methods.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Names that would collide with protocol messages.
    pub fn validate(&self) -> Result<()> {
        match self.methods.keys().find(|name| MessageType::parse(name).is_some()) {
            Some(name) => Err(WireError::ReservedName(name.clone())),
            None => Ok(()),
        }
    }

    /// Parse a manifest document: a JSON object of `"name": "type"` pairs.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let obj = raw
            .as_object()
            .ok_or_else(|| WireError::InvalidManifest("expected a JSON object".to_string()))?;

        let mut manifest = Manifest::new();
        for (name, tag) in obj {
            let tag = tag.as_str().ok_or_else(|| {
                WireError::InvalidManifest(format!("call type for '{name}' must be a string"))
            })?;
            let call_type = tag.parse::<CallType>().map_err(|_| WireError::UnknownCallType {
                method: name.clone(),
                tag: tag.to_string(),
            })?;
            manifest.insert(name.clone(), call_type);
        }
        manifest.validate()?;
        Ok(manifest)
    }
}

impl<N: Into<String>> FromIterator<(N, CallType)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (N, CallType)>>(iter: I) -> Self {
        Self {
            methods: iter.into_iter().map(|(n, ty)| (n.into(), ty)).collect(),
        }
    }
}
