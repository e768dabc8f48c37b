// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0115 entity-capability hashing.
//!
//! The hash input is assembled from a disco#info response: identities,
//! features, and extension data forms, each sorted with the i;octet
//! collation and joined with `<` terminators. The SHA-1 of the UTF-8
//! byte stream is base64-encoded.

use core::fmt;
use std::error::Error as StdError;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use sha1::{Digest, Sha1};

use nodetree::{ns, Node};

use crate::data_form::DataForm;

/// One disco#info `<identity/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoIdentity {
    pub category: String,
    pub type_: String,
    pub lang: Option<String>,
    pub name: Option<String>,
}

impl DiscoIdentity {
    pub fn new(category: &str, type_: &str, name: Option<&str>) -> DiscoIdentity {
        DiscoIdentity {
            category: category.to_owned(),
            type_: type_.to_owned(),
            lang: None,
            name: name.map(str::to_owned),
        }
    }
}

/// Inputs the hash refuses to cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapsHashError {
    /// The element is not a disco#info `<query/>`.
    NotDiscoInfo,
    /// An `<identity/>` is missing its category or type.
    InvalidIdentity,
    /// An extension form has no FORM_TYPE.
    MissingFormType,
    /// Two extension forms share a FORM_TYPE.
    DuplicateFormType,
    /// A non-FORM_TYPE field has no `var`.
    AnonymousField,
}

impl fmt::Display for CapsHashError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CapsHashError::NotDiscoInfo => f.write_str("element is not a disco#info query"),
            CapsHashError::InvalidIdentity => {
                f.write_str("identity is missing its category or type")
            }
            CapsHashError::MissingFormType => f.write_str("extension form has no FORM_TYPE"),
            CapsHashError::DuplicateFormType => {
                f.write_str("two extension forms share a FORM_TYPE")
            }
            CapsHashError::AnonymousField => f.write_str("form field has no var"),
        }
    }
}

impl StdError for CapsHashError {}

fn item(field: &str) -> Vec<u8> {
    let mut bytes = field.as_bytes().to_vec();
    bytes.push(b'<');
    bytes
}

/// Encode and sort a set of entries with the i;octet collation, then
/// concatenate.
fn sorted_items<T, F: Fn(&T) -> Vec<u8>>(things: &[T], encode: F) -> Vec<u8> {
    let mut encoded: Vec<Vec<u8>> = things.iter().map(encode).collect();
    encoded.sort();
    encoded.concat()
}

/// Assemble the XEP-0115 §5 hash input.
pub fn caps_hash_input(
    identities: &[DiscoIdentity],
    features: &[String],
    forms: &[DataForm],
) -> Result<Vec<u8>, CapsHashError> {
    for identity in identities {
        if identity.category.is_empty() || identity.type_.is_empty() {
            return Err(CapsHashError::InvalidIdentity);
        }
    }
    let mut out = sorted_items(identities, |identity| {
        item(&format!(
            "{}/{}/{}/{}",
            identity.category,
            identity.type_,
            identity.lang.as_deref().unwrap_or(""),
            identity.name.as_deref().unwrap_or(""),
        ))
    });

    out.extend(sorted_items(features, |feature| item(feature)));

    // Forms sort by their FORM_TYPE; duplicates or a missing FORM_TYPE
    // abort the hash entirely.
    let mut encoded_forms = Vec::with_capacity(forms.len());
    for form in forms {
        let form_type = form
            .form_type
            .as_deref()
            .ok_or(CapsHashError::MissingFormType)?;
        let mut bytes = item(form_type);

        let mut fields: Vec<&crate::data_form::FormField> = form
            .fields
            .iter()
            .filter(|f| f.var.as_deref() != Some("FORM_TYPE"))
            .collect();
        for field in &fields {
            if field.var.is_none() {
                return Err(CapsHashError::AnonymousField);
            }
        }
        fields.sort_by(|a, b| a.var.cmp(&b.var));
        for field in fields {
            bytes.extend(item(field.var.as_deref().unwrap_or("")));
            bytes.extend(sorted_items(&field.values, |value| item(value)));
        }
        encoded_forms.push((form_type.to_owned(), bytes));
    }
    encoded_forms.sort();
    for window in encoded_forms.windows(2) {
        if window[0].0 == window[1].0 {
            return Err(CapsHashError::DuplicateFormType);
        }
    }
    for (_, bytes) in encoded_forms {
        out.extend(bytes);
    }
    Ok(out)
}

/// The base64-encoded SHA-1 over the hash input.
pub fn caps_hash(
    identities: &[DiscoIdentity],
    features: &[String],
    forms: &[DataForm],
) -> Result<String, CapsHashError> {
    let input = caps_hash_input(identities, features, forms)?;
    let digest = Sha1::digest(&input);
    Ok(Base64.encode(digest))
}

/// Pull identities, features and extension forms out of a
/// `<query xmlns='…disco#info'/>` tree.
pub fn parse_disco_info(
    query: &Node,
) -> Result<(Vec<DiscoIdentity>, Vec<String>, Vec<DataForm>), CapsHashError> {
    if !query.is("query", ns::DISCO_INFO) {
        return Err(CapsHashError::NotDiscoInfo);
    }
    let mut identities = Vec::new();
    let mut features = Vec::new();
    let mut forms = Vec::new();
    for child in query.children() {
        if child.is("identity", ns::DISCO_INFO) {
            let (Some(category), Some(type_)) =
                (child.attribute("category"), child.attribute("type"))
            else {
                return Err(CapsHashError::InvalidIdentity);
            };
            identities.push(DiscoIdentity {
                category: category.to_owned(),
                type_: type_.to_owned(),
                lang: child.lang().map(str::to_owned),
                name: child.attribute("name").map(str::to_owned),
            });
        } else if child.is("feature", ns::DISCO_INFO) {
            if let Some(var) = child.attribute("var") {
                features.push(var.to_owned());
            }
        } else if child.is("x", ns::DATA_FORMS) {
            match DataForm::from_node(child) {
                Ok(form) => forms.push(form),
                Err(e) => {
                    log::warn!("skipping malformed extension form: {}", e);
                }
            }
        }
    }
    Ok((identities, features, forms))
}

/// Hash a whole disco#info `<query/>` tree.
pub fn caps_hash_for_query(query: &Node) -> Result<String, CapsHashError> {
    let (identities, features, forms) = parse_disco_info(query)?;
    caps_hash(&identities, &features, &forms)
}
