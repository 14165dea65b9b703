//! Wire types for the phpIPAM REST API.
//!
//! Every phpIPAM response is wrapped in the same envelope: a status `code`
//! in the body (independent of the HTTP status), a `success` flag, an
//! optional `message` and the payload under `data`. Identifiers are strings
//! in older releases and numbers in newer ones, so they are normalized to
//! [`String`] on decode.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Status code the API reports for a successful read or mutation.
pub const CODE_OK: u16 = 200;

/// Status code the API reports for a created object.
pub const CODE_CREATED: u16 = 201;

/// Status code the API reports for a missing object or an empty search.
pub const CODE_NOT_FOUND: u16 = 404;

/// Response envelope shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: u16,

    #[serde(default, deserialize_with = "flag")]
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Identifier of a created object (first-free allocation).
    #[serde(
        default,
        deserialize_with = "optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: CODE_OK,
            success: true,
            message: None,
            id: None,
            data: Some(data),
        }
    }

    pub fn created(id: impl Into<String>, data: T, message: impl Into<String>) -> Self {
        Self {
            code: CODE_CREATED,
            success: true,
            message: Some(message.into()),
            id: Some(id.into()),
            data: Some(data),
        }
    }

    /// A non-success envelope without payload.
    pub fn failure(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            success: false,
            message: Some(message.into()),
            id: None,
            data: None,
        }
    }

    /// Returns true for the plain `200` status the lifecycle checks expect.
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// Returns true for any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Converts the envelope status into an [`Error::Api`].
    pub fn api_error(&self) -> Error {
        Error::Api {
            code: self.code,
            message: self
                .message
                .clone()
                .unwrap_or_else(|| "no message".to_string()),
        }
    }
}

impl<T> ApiResponse<Vec<T>> {
    /// Returns the listed records.
    ///
    /// phpIPAM answers an empty search or listing with `404`, which yields no
    /// records. Any other non-success status is an [`Error::Api`].
    pub fn into_records(self) -> crate::error::Result<Vec<T>> {
        if self.is_success() {
            Ok(self.data.unwrap_or_default())
        } else if self.code == CODE_NOT_FOUND {
            Ok(Vec::new())
        } else {
            Err(self.api_error())
        }
    }
}

/// A logical grouping of subnets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    #[serde(deserialize_with = "id")]
    pub id: String,

    pub name: String,

    #[serde(default, deserialize_with = "nullable")]
    pub description: String,
}

/// Gateway attached to a subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub ip_addr: String,

    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
}

/// Server-side calculation block of a subnet. Only the fields the
/// address resource exposes are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetCalculation {
    #[serde(rename = "Broadcast", default, deserialize_with = "nullable")]
    pub broadcast: String,

    #[serde(rename = "Subnet bitmask", default, deserialize_with = "nullable")]
    pub bitmask: String,
}

/// A CIDR block within a section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    #[serde(deserialize_with = "id")]
    pub id: String,

    #[serde(default, deserialize_with = "nullable")]
    pub subnet: String,

    #[serde(default, deserialize_with = "nullable")]
    pub mask: String,

    #[serde(rename = "sectionId", deserialize_with = "id")]
    pub section_id: String,

    #[serde(default, deserialize_with = "nullable")]
    pub description: String,

    #[serde(default, deserialize_with = "optional_object")]
    pub gateway: Option<Gateway>,

    #[serde(default, deserialize_with = "optional_object")]
    pub calculation: Option<SubnetCalculation>,
}

impl Subnet {
    pub fn broadcast(&self) -> String {
        self.calculation
            .as_ref()
            .map(|calculation| calculation.broadcast.clone())
            .unwrap_or_default()
    }

    pub fn gateway_ip(&self) -> String {
        self.gateway
            .as_ref()
            .map(|gateway| gateway.ip_addr.clone())
            .unwrap_or_default()
    }

    /// Prefix length, preferring the calculation block over the raw mask.
    pub fn bitmask(&self) -> String {
        match &self.calculation {
            Some(calculation) if !calculation.bitmask.is_empty() => calculation.bitmask.clone(),
            _ => self.mask.clone(),
        }
    }
}

/// A single address record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(deserialize_with = "id")]
    pub id: String,

    #[serde(rename = "subnetId", deserialize_with = "id")]
    pub subnet_id: String,

    pub ip: String,

    #[serde(default, deserialize_with = "nullable")]
    pub hostname: String,

    #[serde(default, deserialize_with = "nullable")]
    pub description: String,

    #[serde(default, deserialize_with = "nullable")]
    pub owner: String,
}

fn id_from_value<E: de::Error>(value: Value) -> Result<String, E> {
    match value {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(E::custom(format!(
            "expected string or number identifier, found {}",
            other
        ))),
    }
}

fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    id_from_value(Value::deserialize(deserializer)?)
}

fn optional_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        value => id_from_value(value).map(Some),
    }
}

fn nullable<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        value => id_from_value(value),
    }
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(flag) => Ok(flag),
        Value::Number(number) => Ok(number.as_u64().is_some_and(|value| value != 0)),
        Value::String(text) => Ok(text == "1" || text.eq_ignore_ascii_case("true")),
        _ => Ok(false),
    }
}

/// phpIPAM renders an absent nested object as `null`, `false` or `"0"`.
fn optional_object<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => serde_json::from_value(value)
            .map(Some)
            .map_err(de::Error::custom),
        _ => Ok(None),
    }
}
