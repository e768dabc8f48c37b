// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0004 data forms, to the extent disco#info extension forms need
//! them.

use core::fmt;
use std::error::Error as StdError;

use nodetree::{ns, Node};

/// A single form field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormField {
    /// The `var` attribute. Fields without one are anonymous (only legal
    /// for `fixed` fields).
    pub var: Option<String>,
    /// The `type` attribute, verbatim.
    pub type_: Option<String>,
    pub values: Vec<String>,
}

impl FormField {
    pub fn new(var: &str, values: &[&str]) -> FormField {
        FormField {
            var: Some(var.to_owned()),
            type_: None,
            values: values.iter().map(|v| (*v).to_owned()).collect(),
        }
    }
}

/// An XEP-0004 form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataForm {
    /// The `type` attribute of the `<x/>` element (`form`, `submit`,
    /// `result`, ...).
    pub type_: Option<String>,
    /// The value of the hidden `FORM_TYPE` field, if present.
    pub form_type: Option<String>,
    /// All fields, `FORM_TYPE` included, in document order.
    pub fields: Vec<FormField>,
}

/// Failure decoding an `<x xmlns='jabber:x:data'/>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFormError {
    NotAForm,
    MultipleFormTypes,
}

impl fmt::Display for DataFormError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DataFormError::NotAForm => f.write_str("element is not a jabber:x:data form"),
            DataFormError::MultipleFormTypes => {
                f.write_str("form has more than one FORM_TYPE field")
            }
        }
    }
}

impl StdError for DataFormError {}

impl DataForm {
    /// Decode an `<x xmlns='jabber:x:data'/>` element.
    pub fn from_node(node: &Node) -> Result<DataForm, DataFormError> {
        if !node.is("x", ns::DATA_FORMS) {
            return Err(DataFormError::NotAForm);
        }
        let mut form = DataForm {
            type_: node.attribute("type").map(str::to_owned),
            form_type: None,
            fields: Vec::new(),
        };
        for child in node.children() {
            if !child.is("field", ns::DATA_FORMS) {
                continue;
            }
            let field = FormField {
                var: child.attribute("var").map(str::to_owned),
                type_: child.attribute("type").map(str::to_owned),
                values: child
                    .children()
                    .filter(|c| c.is("value", ns::DATA_FORMS))
                    .map(|c| c.content().unwrap_or_default().to_owned())
                    .collect(),
            };
            if field.var.as_deref() == Some("FORM_TYPE") {
                if form.form_type.is_some() {
                    return Err(DataFormError::MultipleFormTypes);
                }
                form.form_type = field.values.first().cloned();
            }
            form.fields.push(field);
        }
        Ok(form)
    }

    /// Serialise back to an `<x xmlns='jabber:x:data'/>` element.
    pub fn to_node(&self) -> Node {
        let mut x = Node::new("x", ns::DATA_FORMS);
        if let Some(ref type_) = self.type_ {
            x.set_attribute("type", type_.clone());
        }
        for field in &self.fields {
            let f = x.add_child("field");
            if let Some(ref var) = field.var {
                f.set_attribute("var", var.clone());
            }
            if let Some(ref type_) = field.type_ {
                f.set_attribute("type", type_.clone());
            }
            for value in &field.values {
                f.add_child("value").set_content(value.clone());
            }
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form_node() -> Node {
        let mut x = Node::new("x", ns::DATA_FORMS);
        x.set_attribute("type", "result");
        let ft = x.add_child("field");
        ft.set_attribute("var", "FORM_TYPE");
        ft.set_attribute("type", "hidden");
        ft.add_child("value")
            .set_content("urn:xmpp:dataforms:softwareinfo");
        let os = x.add_child("field");
        os.set_attribute("var", "os");
        os.add_child("value").set_content("Mac");
        x
    }

    #[test]
    fn decode() {
        let form = DataForm::from_node(&form_node()).unwrap();
        assert_eq!(form.type_.as_deref(), Some("result"));
        assert_eq!(
            form.form_type.as_deref(),
            Some("urn:xmpp:dataforms:softwareinfo")
        );
        assert_eq!(form.fields.len(), 2);
        assert_eq!(form.fields[1].values, vec!["Mac".to_owned()]);
    }

    #[test]
    fn rejects_foreign_elements() {
        let node = Node::new("query", ns::DISCO_INFO);
        assert_eq!(DataForm::from_node(&node), Err(DataFormError::NotAForm));
    }

    #[test]
    fn rejects_duplicate_form_type_fields() {
        let mut x = form_node();
        let dup = x.add_child("field");
        dup.set_attribute("var", "FORM_TYPE");
        dup.add_child("value").set_content("urn:other");
        assert_eq!(
            DataForm::from_node(&x),
            Err(DataFormError::MultipleFormTypes)
        );
    }

    #[test]
    fn round_trip() {
        let form = DataForm::from_node(&form_node()).unwrap();
        let back = DataForm::from_node(&form.to_node()).unwrap();
        assert_eq!(form, back);
    }
}
