// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Typed stanza wrapper over a [`NodeTree`].

use jid::Jid;
use rand::{thread_rng, Rng};

use nodetree::{build, ns, BuildStep, Node, NodeTree};

use crate::error::Error;
use crate::xmpp_error::{CoreStanzaError, StanzaError};

/// The closed set of top-level stream elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaType {
    Message,
    Presence,
    Iq,
    Stream,
    Features,
    Auth,
    Challenge,
    Response,
    Success,
    Failure,
    StreamError,
}

/// The `type` attribute of a stanza, decoded against the closed per-type
/// sets. `None`, `Error` and `Unknown` are legal for every type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaSubType {
    None,
    // message
    Normal,
    Chat,
    Groupchat,
    Headline,
    // presence
    Available,
    Unavailable,
    Probe,
    Subscribe,
    Unsubscribe,
    Subscribed,
    Unsubscribed,
    // iq
    Get,
    Set,
    Result,
    // universal
    Error,
    Unknown,
}

impl StanzaSubType {
    /// Whether this sub-type may be combined with the given type.
    pub fn valid_for(self, type_: StanzaType) -> bool {
        use StanzaSubType::*;
        match self {
            None | Error | Unknown => true,
            Normal | Chat | Groupchat | Headline => type_ == StanzaType::Message,
            Available | Unavailable | Probe | Subscribe | Unsubscribe | Subscribed
            | Unsubscribed => type_ == StanzaType::Presence,
            Get | Set | Result => type_ == StanzaType::Iq,
        }
    }

    /// The wire value of this sub-type, when it has one.
    pub fn as_attr(self) -> Option<&'static str> {
        use StanzaSubType::*;
        match self {
            None | Unknown => Option::None,
            Normal => Some("normal"),
            Chat => Some("chat"),
            Groupchat => Some("groupchat"),
            Headline => Some("headline"),
            Available => Some("available"),
            Unavailable => Some("unavailable"),
            Probe => Some("probe"),
            Subscribe => Some("subscribe"),
            Unsubscribe => Some("unsubscribe"),
            Subscribed => Some("subscribed"),
            Unsubscribed => Some("unsubscribed"),
            Get => Some("get"),
            Set => Some("set"),
            Result => Some("result"),
            Error => Some("error"),
        }
    }

    fn from_attr(value: &str) -> StanzaSubType {
        use StanzaSubType::*;
        match value {
            "normal" => Normal,
            "chat" => Chat,
            "groupchat" => Groupchat,
            "headline" => Headline,
            "available" => Available,
            "unavailable" => Unavailable,
            "probe" => Probe,
            "subscribe" => Subscribe,
            "unsubscribe" => Unsubscribe,
            "subscribed" => Subscribed,
            "unsubscribed" => Unsubscribed,
            "get" => Get,
            "set" => Set,
            "result" => Result,
            "error" => Error,
            _ => Unknown,
        }
    }
}

impl StanzaType {
    /// Root element name and namespace for this type.
    fn wire_name(self) -> (&'static str, nodetree::NsQuark) {
        match self {
            StanzaType::Message => ("message", ns::CLIENT),
            StanzaType::Presence => ("presence", ns::CLIENT),
            StanzaType::Iq => ("iq", ns::CLIENT),
            StanzaType::Stream => ("stream", ns::STREAM),
            StanzaType::Features => ("features", ns::STREAM),
            StanzaType::StreamError => ("error", ns::STREAM),
            StanzaType::Auth => ("auth", ns::SASL),
            StanzaType::Challenge => ("challenge", ns::SASL),
            StanzaType::Response => ("response", ns::SASL),
            StanzaType::Success => ("success", ns::SASL),
            StanzaType::Failure => ("failure", ns::SASL),
        }
    }

    fn classify(root: &Node) -> Option<StanzaType> {
        let type_ = match (root.name(), root.ns()) {
            ("message", q) if q == ns::CLIENT => StanzaType::Message,
            ("presence", q) if q == ns::CLIENT => StanzaType::Presence,
            ("iq", q) if q == ns::CLIENT => StanzaType::Iq,
            ("stream", q) if q == ns::STREAM => StanzaType::Stream,
            ("features", q) if q == ns::STREAM => StanzaType::Features,
            ("error", q) if q == ns::STREAM => StanzaType::StreamError,
            ("auth", q) if q == ns::SASL => StanzaType::Auth,
            ("challenge", q) if q == ns::SASL => StanzaType::Challenge,
            ("response", q) if q == ns::SASL => StanzaType::Response,
            ("success", q) if q == ns::SASL => StanzaType::Success,
            ("failure", q) if q == ns::SASL => StanzaType::Failure,
            _ => return None,
        };
        Some(type_)
    }
}

pub(crate) fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// A stanza: a [`NodeTree`] with its decoded `(type, sub_type)` pair
/// cached at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    tree: NodeTree,
    type_: StanzaType,
    sub_type: StanzaSubType,
}

impl Stanza {
    /// Wrap a parsed tree, classifying its root. Trees whose root is not
    /// one of the closed top-level set are rejected.
    pub fn from_tree(tree: NodeTree) -> Result<Stanza, NodeTree> {
        let Some(type_) = StanzaType::classify(tree.root()) else {
            return Err(tree);
        };
        let sub_type = match tree.root().attribute("type") {
            Some(value) => StanzaSubType::from_attr(value),
            None => StanzaSubType::None,
        };
        Ok(Stanza {
            tree,
            type_,
            sub_type,
        })
    }

    /// Build a stanza from the flat opcode DSL.
    ///
    /// Rejects sub-types that are not declared against the type.
    pub fn build(
        type_: StanzaType,
        sub_type: StanzaSubType,
        from: Option<&str>,
        to: Option<&str>,
        steps: &[BuildStep<'_>],
    ) -> Result<Stanza, Error> {
        if !sub_type.valid_for(type_) {
            log::warn!(
                "sub-type {:?} is not legal for stanza type {:?}",
                sub_type,
                type_
            );
            return Err(Error::InvalidSubType);
        }
        let (name, q) = type_.wire_name();
        let (mut tree, _) = build(name, q, steps);
        if let Some(value) = sub_type.as_attr() {
            tree.root_mut().set_attribute("type", value);
        }
        if let Some(from) = from {
            tree.root_mut().set_attribute("from", from);
        }
        if let Some(to) = to {
            tree.root_mut().set_attribute("to", to);
        }
        Ok(Stanza {
            tree,
            type_,
            sub_type,
        })
    }

    pub fn type_info(&self) -> (StanzaType, StanzaSubType) {
        (self.type_, self.sub_type)
    }

    pub fn stanza_type(&self) -> StanzaType {
        self.type_
    }

    pub fn sub_type(&self) -> StanzaSubType {
        self.sub_type
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn into_tree(self) -> NodeTree {
        self.tree
    }

    pub fn root(&self) -> &Node {
        self.tree.root()
    }

    /// Mutable access to the tree. The cached type information is derived
    /// from the root name and `type` attribute at construction; callers
    /// mutating those rebuild via [`Stanza::from_tree`].
    pub fn root_mut(&mut self) -> &mut Node {
        self.tree.root_mut()
    }

    pub fn from_attr(&self) -> Option<&str> {
        self.root().attribute("from")
    }

    pub fn to_attr(&self) -> Option<&str> {
        self.root().attribute("to")
    }

    pub fn id(&self) -> Option<&str> {
        self.root().attribute("id")
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.root_mut().set_attribute("id", id.into());
    }

    pub fn set_from(&mut self, from: impl Into<String>) {
        self.root_mut().set_attribute("from", from.into());
    }

    pub fn set_to(&mut self, to: impl Into<String>) {
        self.root_mut().set_attribute("to", to.into());
    }

    /// Assign a random id if none is present yet.
    pub fn ensure_id(&mut self) -> &str {
        if self.id().is_none() {
            let id = make_id();
            self.root_mut().set_attribute("id", id);
        }
        self.id().unwrap()
    }

    /// The sender, parsed. `None` when absent or malformed.
    pub fn from_jid(&self) -> Option<Jid> {
        self.from_attr().and_then(|f| Jid::new(f).ok())
    }

    pub fn to_jid(&self) -> Option<Jid> {
        self.to_attr().and_then(|t| Jid::new(t).ok())
    }

    /// Is this one of the stanza kinds counted by stream management?
    pub fn is_sm_counted(&self) -> bool {
        matches!(
            self.type_,
            StanzaType::Message | StanzaType::Presence | StanzaType::Iq
        )
    }

    /// Decode the `<error/>` child, if any.
    pub fn stanza_error(&self) -> Option<StanzaError> {
        self.root()
            .child_ns("error", ns::CLIENT)
            .map(StanzaError::from_node)
    }

    /// Whether this is an `iq` of sub-type `get` or `set`.
    pub fn is_iq_request(&self) -> bool {
        self.type_ == StanzaType::Iq
            && matches!(self.sub_type, StanzaSubType::Get | StanzaSubType::Set)
    }

    /// Build an `<iq type='result'/>` reply: the id is copied and the
    /// addressing is swapped relative to the request.
    pub fn iq_result(request: &Stanza, steps: &[BuildStep<'_>]) -> Result<Stanza, Error> {
        if !request.is_iq_request() {
            return Err(Error::NotIq);
        }
        let mut reply = Stanza::build(
            StanzaType::Iq,
            StanzaSubType::Result,
            request.to_attr(),
            request.from_attr(),
            steps,
        )?;
        if let Some(id) = request.id() {
            reply.set_id(id.to_owned());
        }
        Ok(reply)
    }

    /// Build an `<iq type='error'/>` reply.
    ///
    /// The request's first child is deep-copied into the reply (RFC 3920
    /// §9.2.3) before the `<error/>` element.
    pub fn iq_error(
        request: &Stanza,
        condition: CoreStanzaError,
        text: Option<&str>,
    ) -> Result<Stanza, Error> {
        if !request.is_iq_request() {
            return Err(Error::NotIq);
        }
        let mut reply = Stanza::build(
            StanzaType::Iq,
            StanzaSubType::Error,
            request.to_attr(),
            request.from_attr(),
            &[],
        )?;
        if let Some(id) = request.id() {
            reply.set_id(id.to_owned());
        }
        if let Some(child) = request.root().first_child() {
            reply.root_mut().add_node(child.clone());
        }
        let error = StanzaError::new(condition, text);
        reply.root_mut().add_node(error.to_node());
        Ok(reply)
    }
}
