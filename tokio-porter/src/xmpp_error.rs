// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XMPP error taxonomy: stanza errors, stream errors, and their node
//! representations.

use core::fmt;
use std::error::Error as StdError;
use std::sync::{OnceLock, RwLock};

use nodetree::{ns, Node, NodeTree, NsQuark};

/// The `type` attribute of an `<error/>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Retry after providing credentials.
    Auth,
    /// Do not retry; the error cannot be remedied.
    Cancel,
    /// Proceed; the condition was only a warning.
    Continue,
    /// Retry after changing the data sent.
    Modify,
    /// Retry after waiting; the error is temporary.
    Wait,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }

    pub fn from_str(s: &str) -> Option<ErrorType> {
        match s {
            "auth" => Some(ErrorType::Auth),
            "cancel" => Some(ErrorType::Cancel),
            "continue" => Some(ErrorType::Continue),
            "modify" => Some(ErrorType::Modify),
            "wait" => Some(ErrorType::Wait),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ErrorSpec {
    condition: CoreStanzaError,
    name: &'static str,
    default_type: ErrorType,
    /// XEP-0086 legacy codes, most specific first. The first entry is the
    /// one emitted when serialising.
    legacy_codes: &'static [u16],
    description: &'static str,
}

/// The closed set of RFC 6120 stanza error conditions
/// (`urn:ietf:params:xml:ns:xmpp-stanzas`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStanzaError {
    UndefinedCondition,
    Redirect,
    Gone,
    BadRequest,
    UnexpectedRequest,
    JidMalformed,
    NotAuthorized,
    PaymentRequired,
    Forbidden,
    ItemNotFound,
    RecipientUnavailable,
    RemoteServerNotFound,
    NotAllowed,
    NotAcceptable,
    RegistrationRequired,
    SubscriptionRequired,
    RemoteServerTimeout,
    Conflict,
    InternalServerError,
    ResourceConstraint,
    FeatureNotImplemented,
    ServiceUnavailable,
    PolicyViolation,
}

/// Table order decides which condition wins a shared legacy code; it
/// matches the historical mapping (404 is item-not-found, 407 is
/// registration-required, 500 is internal-server-error).
static SPECS: &[ErrorSpec] = &[
    ErrorSpec {
        condition: CoreStanzaError::UndefinedCondition,
        name: "undefined-condition",
        default_type: ErrorType::Cancel,
        legacy_codes: &[500],
        description: "application-specific condition",
    },
    ErrorSpec {
        condition: CoreStanzaError::Redirect,
        name: "redirect",
        default_type: ErrorType::Modify,
        legacy_codes: &[302],
        description: "the recipient or server is redirecting requests for \
                      this information to another entity",
    },
    ErrorSpec {
        condition: CoreStanzaError::Gone,
        name: "gone",
        default_type: ErrorType::Modify,
        legacy_codes: &[302],
        description: "the recipient or server can no longer be contacted \
                      at this address",
    },
    ErrorSpec {
        condition: CoreStanzaError::BadRequest,
        name: "bad-request",
        default_type: ErrorType::Modify,
        legacy_codes: &[400],
        description: "the sender has sent XML that is malformed or that \
                      cannot be processed",
    },
    ErrorSpec {
        condition: CoreStanzaError::UnexpectedRequest,
        name: "unexpected-request",
        default_type: ErrorType::Wait,
        legacy_codes: &[400],
        description: "the recipient or server understood the request but \
                      was not expecting it at this time",
    },
    ErrorSpec {
        condition: CoreStanzaError::JidMalformed,
        name: "jid-malformed",
        default_type: ErrorType::Modify,
        legacy_codes: &[400],
        description: "the sending entity has provided an XMPP address that \
                      does not adhere to the addressing syntax",
    },
    ErrorSpec {
        condition: CoreStanzaError::NotAuthorized,
        name: "not-authorized",
        default_type: ErrorType::Auth,
        legacy_codes: &[401],
        description: "the sender must provide proper credentials before \
                      being allowed to perform the action",
    },
    ErrorSpec {
        condition: CoreStanzaError::PaymentRequired,
        name: "payment-required",
        default_type: ErrorType::Auth,
        legacy_codes: &[402],
        description: "the requesting entity is not authorized to access \
                      the requested service because payment is required",
    },
    ErrorSpec {
        condition: CoreStanzaError::Forbidden,
        name: "forbidden",
        default_type: ErrorType::Auth,
        legacy_codes: &[403],
        description: "the requesting entity does not possess the required \
                      permissions to perform the action",
    },
    ErrorSpec {
        condition: CoreStanzaError::ItemNotFound,
        name: "item-not-found",
        default_type: ErrorType::Cancel,
        legacy_codes: &[404],
        description: "the addressed JID or item requested cannot be found",
    },
    ErrorSpec {
        condition: CoreStanzaError::RecipientUnavailable,
        name: "recipient-unavailable",
        default_type: ErrorType::Wait,
        legacy_codes: &[404],
        description: "the intended recipient is temporarily unavailable",
    },
    ErrorSpec {
        condition: CoreStanzaError::RemoteServerNotFound,
        name: "remote-server-not-found",
        default_type: ErrorType::Cancel,
        legacy_codes: &[404],
        description: "a remote server or service specified in the JID of \
                      the intended recipient could not be contacted",
    },
    ErrorSpec {
        condition: CoreStanzaError::NotAllowed,
        name: "not-allowed",
        default_type: ErrorType::Cancel,
        legacy_codes: &[405],
        description: "the recipient or server does not allow any entity to \
                      perform the action",
    },
    ErrorSpec {
        condition: CoreStanzaError::NotAcceptable,
        name: "not-acceptable",
        default_type: ErrorType::Modify,
        legacy_codes: &[406],
        description: "the recipient or server is refusing to process the \
                      request because it does not meet its criteria",
    },
    ErrorSpec {
        condition: CoreStanzaError::RegistrationRequired,
        name: "registration-required",
        default_type: ErrorType::Auth,
        legacy_codes: &[407],
        description: "the requesting entity is not authorized to access \
                      the requested service because registration is required",
    },
    ErrorSpec {
        condition: CoreStanzaError::SubscriptionRequired,
        name: "subscription-required",
        default_type: ErrorType::Auth,
        legacy_codes: &[407],
        description: "the requesting entity is not authorized to access \
                      the requested service because a subscription is required",
    },
    ErrorSpec {
        condition: CoreStanzaError::RemoteServerTimeout,
        name: "remote-server-timeout",
        default_type: ErrorType::Wait,
        legacy_codes: &[408, 504],
        description: "a remote server or service specified in the JID of \
                      the intended recipient could not be contacted within \
                      a reasonable amount of time",
    },
    ErrorSpec {
        condition: CoreStanzaError::Conflict,
        name: "conflict",
        default_type: ErrorType::Cancel,
        legacy_codes: &[409],
        description: "access cannot be granted because an existing resource \
                      or session exists with the same name or address",
    },
    ErrorSpec {
        condition: CoreStanzaError::InternalServerError,
        name: "internal-server-error",
        default_type: ErrorType::Wait,
        legacy_codes: &[500],
        description: "the server could not process the stanza because of a \
                      misconfiguration or an otherwise-undefined internal \
                      server error",
    },
    ErrorSpec {
        condition: CoreStanzaError::ResourceConstraint,
        name: "resource-constraint",
        default_type: ErrorType::Wait,
        legacy_codes: &[500],
        description: "the server or recipient lacks the system resources \
                      necessary to service the request",
    },
    ErrorSpec {
        condition: CoreStanzaError::FeatureNotImplemented,
        name: "feature-not-implemented",
        default_type: ErrorType::Cancel,
        legacy_codes: &[501],
        description: "the feature requested is not implemented by the \
                      recipient or server",
    },
    ErrorSpec {
        condition: CoreStanzaError::ServiceUnavailable,
        name: "service-unavailable",
        default_type: ErrorType::Cancel,
        legacy_codes: &[502, 503, 510],
        description: "the server or recipient does not currently provide \
                      the requested service",
    },
    ErrorSpec {
        condition: CoreStanzaError::PolicyViolation,
        name: "policy-violation",
        default_type: ErrorType::Modify,
        legacy_codes: &[],
        description: "the entity has violated some local service policy",
    },
];

impl CoreStanzaError {
    fn spec(self) -> &'static ErrorSpec {
        SPECS
            .iter()
            .find(|s| s.condition == self)
            .expect("every condition has a table entry")
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn default_type(self) -> ErrorType {
        self.spec().default_type
    }

    pub fn description(self) -> &'static str {
        self.spec().description
    }

    /// The legacy code emitted when serialising, if the condition has one.
    pub fn legacy_code(self) -> Option<u16> {
        self.spec().legacy_codes.first().copied()
    }

    pub fn from_name(name: &str) -> Option<CoreStanzaError> {
        SPECS.iter().find(|s| s.name == name).map(|s| s.condition)
    }

    /// Map an XEP-0086 legacy code to the closest condition.
    ///
    /// `undefined-condition` is skipped so that code 500 resolves to
    /// `internal-server-error`.
    pub fn from_legacy_code(code: u16) -> Option<CoreStanzaError> {
        SPECS
            .iter()
            .filter(|s| s.condition != CoreStanzaError::UndefinedCondition)
            .find(|s| s.legacy_codes.contains(&code))
            .map(|s| s.condition)
    }
}

impl fmt::Display for CoreStanzaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A specialized (application-domain) error condition carried next to the
/// core condition inside `<error/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecializedError {
    pub ns: NsQuark,
    pub name: String,
}

/// Registry of specialized error domains.
///
/// Extension modules register the namespaces (and condition names) they
/// understand; decoding then reports a matching first non-stanzas child as
/// a recognised [`SpecializedError`].
fn domains() -> &'static RwLock<Vec<(NsQuark, Vec<String>)>> {
    static DOMAINS: OnceLock<RwLock<Vec<(NsQuark, Vec<String>)>>> = OnceLock::new();
    DOMAINS.get_or_init(|| RwLock::new(Vec::new()))
}

/// Register an application error domain.
pub fn register_error_domain(ns: NsQuark, conditions: &[&str]) {
    let mut domains = domains().write().unwrap();
    if let Some(entry) = domains.iter_mut().find(|(q, _)| *q == ns) {
        for c in conditions {
            if !entry.1.iter().any(|e| e == c) {
                entry.1.push((*c).to_owned());
            }
        }
        return;
    }
    domains.push((ns, conditions.iter().map(|c| (*c).to_owned()).collect()));
}

fn lookup_specialized(node: &Node) -> Option<SpecializedError> {
    let domains = domains().read().unwrap();
    let (_, conditions) = domains.iter().find(|(q, _)| *q == node.ns())?;
    if conditions.iter().any(|c| c == node.name()) {
        Some(SpecializedError {
            ns: node.ns(),
            name: node.name().to_owned(),
        })
    } else {
        None
    }
}

/// A fully decoded stanza-level `<error/>`.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    pub type_: ErrorType,
    pub core: CoreStanzaError,
    /// The first non-stanzas child, when it belongs to a registered
    /// domain.
    pub specialized: Option<SpecializedError>,
    /// The raw first non-stanzas child, registered or not.
    pub specialized_node: Option<Node>,
    pub text: Option<String>,
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.core, self.type_)?;
        if let Some(ref text) = self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

impl StdError for StanzaError {}

impl StanzaError {
    /// Decode an `<error/>` element.
    pub fn from_node(error_node: &Node) -> StanzaError {
        let mut core = None;
        let mut specialized_node = None;
        let mut text = None;

        for child in error_node.children() {
            if child.ns() == ns::STANZAS {
                if child.name() == "text" {
                    if text.is_none() {
                        text = child.content().map(str::to_owned);
                    }
                } else if core.is_none() {
                    core = CoreStanzaError::from_name(child.name());
                }
            } else if specialized_node.is_none() {
                specialized_node = Some(child.clone());
            }
        }

        // Fall back to the legacy code attribute when no modern condition
        // was recognised.
        let core = core
            .or_else(|| {
                error_node
                    .attribute("code")
                    .and_then(|c| c.parse::<u16>().ok())
                    .and_then(CoreStanzaError::from_legacy_code)
            })
            .unwrap_or(CoreStanzaError::UndefinedCondition);

        let type_ = error_node
            .attribute("type")
            .and_then(ErrorType::from_str)
            .unwrap_or_else(|| core.default_type());

        let specialized = specialized_node.as_ref().and_then(lookup_specialized);

        StanzaError {
            type_,
            core,
            specialized,
            specialized_node,
            text,
        }
    }

    /// Build the `<error/>` element for this error, with both the modern
    /// condition and the first legacy code.
    pub fn to_node(&self) -> Node {
        let mut error = Node::new("error", ns::CLIENT);
        error.set_attribute("type", self.type_.as_str());
        if let Some(code) = self.core.legacy_code() {
            error.set_attribute("code", code.to_string());
        }
        error.add_child_ns(self.core.name(), ns::STANZAS);
        if let Some(ref node) = self.specialized_node {
            error.add_node(node.clone());
        }
        if let Some(ref text) = self.text {
            error
                .add_child_ns("text", ns::STANZAS)
                .set_content(text.clone());
        }
        error
    }

    /// Shorthand for an error with the condition's default type.
    pub fn new(core: CoreStanzaError, text: Option<&str>) -> StanzaError {
        StanzaError {
            type_: core.default_type(),
            core,
            specialized: None,
            specialized_node: None,
            text: text.map(str::to_owned),
        }
    }
}

/// The closed set of RFC 6120 stream error conditions
/// (`urn:ietf:params:xml:ns:xmpp-streams`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    RemoteConnectionFailed,
    Reset,
    ResourceConstraint,
    RestrictedXml,
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedEncoding,
    UnsupportedFeature,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

static STREAM_CONDITIONS: &[(StreamErrorCondition, &str)] = &[
    (StreamErrorCondition::BadFormat, "bad-format"),
    (
        StreamErrorCondition::BadNamespacePrefix,
        "bad-namespace-prefix",
    ),
    (StreamErrorCondition::Conflict, "conflict"),
    (StreamErrorCondition::ConnectionTimeout, "connection-timeout"),
    (StreamErrorCondition::HostGone, "host-gone"),
    (StreamErrorCondition::HostUnknown, "host-unknown"),
    (
        StreamErrorCondition::ImproperAddressing,
        "improper-addressing",
    ),
    (
        StreamErrorCondition::InternalServerError,
        "internal-server-error",
    ),
    (StreamErrorCondition::InvalidFrom, "invalid-from"),
    (StreamErrorCondition::InvalidNamespace, "invalid-namespace"),
    (StreamErrorCondition::InvalidXml, "invalid-xml"),
    (StreamErrorCondition::NotAuthorized, "not-authorized"),
    (StreamErrorCondition::NotWellFormed, "not-well-formed"),
    (StreamErrorCondition::PolicyViolation, "policy-violation"),
    (
        StreamErrorCondition::RemoteConnectionFailed,
        "remote-connection-failed",
    ),
    (StreamErrorCondition::Reset, "reset"),
    (
        StreamErrorCondition::ResourceConstraint,
        "resource-constraint",
    ),
    (StreamErrorCondition::RestrictedXml, "restricted-xml"),
    (StreamErrorCondition::SeeOtherHost, "see-other-host"),
    (StreamErrorCondition::SystemShutdown, "system-shutdown"),
    (
        StreamErrorCondition::UndefinedCondition,
        "undefined-condition",
    ),
    (
        StreamErrorCondition::UnsupportedEncoding,
        "unsupported-encoding",
    ),
    (
        StreamErrorCondition::UnsupportedFeature,
        "unsupported-feature",
    ),
    (
        StreamErrorCondition::UnsupportedStanzaType,
        "unsupported-stanza-type",
    ),
    (
        StreamErrorCondition::UnsupportedVersion,
        "unsupported-version",
    ),
];

impl StreamErrorCondition {
    pub fn name(self) -> &'static str {
        STREAM_CONDITIONS
            .iter()
            .find(|(c, _)| *c == self)
            .map(|(_, n)| *n)
            .expect("every condition has a name")
    }

    pub fn from_name(name: &str) -> Option<StreamErrorCondition> {
        STREAM_CONDITIONS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(c, _)| *c)
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded `<stream:error/>`. Receiving one logically closes the
/// stream, even while the transport is still open.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    pub condition: StreamErrorCondition,
    pub text: Option<String>,
    /// Application-specific children other than the condition and text.
    pub application: Option<Node>,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.condition)?;
        if let Some(ref text) = self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

impl StdError for StreamError {}

impl StreamError {
    pub fn new(condition: StreamErrorCondition, text: Option<&str>) -> StreamError {
        StreamError {
            condition,
            text: text.map(str::to_owned),
            application: None,
        }
    }

    /// Decode a `<stream:error/>` root element.
    pub fn from_node(root: &Node) -> StreamError {
        let mut condition = StreamErrorCondition::UndefinedCondition;
        let mut text = None;
        let mut application = None;
        for child in root.children() {
            if child.ns() == ns::STREAMS {
                if child.name() == "text" {
                    text = child.content().map(str::to_owned);
                } else if let Some(c) = StreamErrorCondition::from_name(child.name()) {
                    condition = c;
                }
            } else if application.is_none() {
                application = Some(child.clone());
            }
        }
        StreamError {
            condition,
            text,
            application,
        }
    }

    /// Build the `<stream:error/>` tree for this error.
    pub fn to_tree(&self) -> NodeTree {
        let mut root = Node::new("error", ns::STREAM);
        root.add_child_ns(self.condition.name(), ns::STREAMS);
        if let Some(ref text) = self.text {
            root.add_child_ns("text", ns::STREAMS)
                .set_content(text.clone());
        }
        if let Some(ref node) = self.application {
            root.add_node(node.clone());
        }
        NodeTree::new(root)
    }
}
