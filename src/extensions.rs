//! # Extensions
//!
//! Negotiation of `Sec-WebSocket-Extensions`, currently the permessage-deflate extension of
//! [RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692).
//!
//! Negotiation happens in three steps:
//!
//! 1. The header is parsed into [`ExtensionOffer`]s: a token followed by `;`-separated
//!    parameters, offers separated by commas.
//! 2. Each permessage-deflate offer is validated against a fixed parameter table and turned
//!    into [`DeflateParams`]. Problems are reported as a [`NegotiationError`] carrying the
//!    offending token.
//! 3. An agreement policy decides the parameters in force. The server policy answers an offer
//!    ([`negotiate_server`]), the client policy checks the server's answer against what was
//!    offered ([`negotiate_client`]).
//!
//! The outcome is a [`NegotiatedExtensions`]: an ordered list of [`Extension`]s, fixed for the
//! lifetime of the connection, in which no two extensions claim the same RSV bit. It produces
//! the per-connection payload transforms the send path and the receive path run.
use bytes::BytesMut;
use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, space0},
    combinator::{all_consuming, opt},
    multi::{many0, separated_list1},
    sequence::{delimited, preceded},
    IResult, Parser,
};
use thiserror::Error;

use crate::{
    codec::Role,
    compression::{CompressionLevel, Deflater, Inflater},
    DeflateOptions, Result, WebSocketError,
};

/// Registered token of the per-message compression extension.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// RSV1 in its byte-0 position.
pub const RSV1: u8 = 0x40;

/// Largest LZ77 window a peer may ask for.
const MAX_WINDOW_BITS: u8 = 15;

/// Why an offer or response could not be agreed on. Every variant carries the token that
/// caused the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The header does not follow the extension grammar.
    #[error("Malformed extension header: {0}")]
    Malformed(String),
    /// The token names an extension that is not supported or was not offered.
    #[error("Unknown extension: {0}")]
    UnknownExtension(String),
    /// A parameter is not in the parameter table or has an invalid value.
    #[error("Invalid extension parameter: {0}")]
    InvalidParameter(String),
    /// A parameter appears more than once in one offer.
    #[error("Duplicate extension parameter: {0}")]
    DuplicateParameter(String),
    /// Two negotiated extensions want the same RSV bit.
    #[error("Extension {0} conflicts with the reserved bits of another extension")]
    RsvConflict(String),
}

impl NegotiationError {
    /// The offending token.
    pub fn token(&self) -> &str {
        match self {
            Self::Malformed(token)
            | Self::UnknownExtension(token)
            | Self::InvalidParameter(token)
            | Self::DuplicateParameter(token)
            | Self::RsvConflict(token) => token,
        }
    }
}

/// One `name[=value]` parameter of an offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    pub name: String,
    pub value: Option<String>,
}

/// One extension as it appears in a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub token: String,
    pub params: Vec<ExtensionParam>,
}

fn is_tchar(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(is_tchar).parse(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c: char| c != '"' && c != '\\'), char('"')).parse(input)
}

fn param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        (space0, char(';'), space0),
        (
            token,
            opt(preceded((space0, char('='), space0), alt((quoted, token)))),
        ),
    )
    .parse(input)
}

type RawOffer<'a> = (&'a str, Vec<(&'a str, Option<&'a str>)>);

fn offer(input: &str) -> IResult<&str, RawOffer<'_>> {
    delimited(space0, (token, many0(param)), space0).parse(input)
}

impl ExtensionOffer {
    /// Parses a single offer such as `permessage-deflate; client_max_window_bits`.
    pub fn parse(input: &str) -> std::result::Result<Self, NegotiationError> {
        let (_, raw) = all_consuming(offer)
            .parse(input)
            .map_err(|_| NegotiationError::Malformed(input.trim().to_owned()))?;
        Ok(Self::from_raw(raw))
    }

    /// Parses a whole header value: one or more offers separated by commas.
    pub fn parse_list(input: &str) -> std::result::Result<Vec<Self>, NegotiationError> {
        let (_, raw) = all_consuming(separated_list1(char(','), offer))
            .parse(input)
            .map_err(|_| NegotiationError::Malformed(input.trim().to_owned()))?;
        Ok(raw.into_iter().map(Self::from_raw).collect())
    }

    fn from_raw((token, params): RawOffer<'_>) -> Self {
        Self {
            token: token.to_owned(),
            params: params
                .into_iter()
                .map(|(name, value)| ExtensionParam {
                    name: name.to_owned(),
                    value: value.map(str::to_owned),
                })
                .collect(),
        }
    }

    /// Looks up a parameter by name.
    pub fn param(&self, name: &str) -> Option<&ExtensionParam> {
        self.params.iter().find(|p| p.name == name)
    }

    fn with_param(mut self, name: &str, value: Option<u8>) -> Self {
        self.params.push(ExtensionParam {
            name: name.to_owned(),
            value: value.map(|v| v.to_string()),
        });
        self
    }
}

impl std::fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.token)?;
        for param in &self.params {
            write!(f, "; {}", param.name)?;
            match &param.value {
                Some(value) if value.chars().all(is_tchar) => write!(f, "={value}")?,
                Some(value) => write!(f, "=\"{value}\"")?,
                None => {}
            }
        }
        Ok(())
    }
}

/// What a parameter's value may look like.
#[derive(Debug, Clone, Copy)]
enum ValueRule {
    Absent,
    WindowBits,
    OptionalWindowBits,
}

/// Every parameter permessage-deflate defines.
const DEFLATE_PARAMETERS: [(&str, ValueRule); 4] = [
    ("server_no_context_takeover", ValueRule::Absent),
    ("client_no_context_takeover", ValueRule::Absent),
    ("server_max_window_bits", ValueRule::WindowBits),
    ("client_max_window_bits", ValueRule::OptionalWindowBits),
];

fn parse_window_bits(value: &str) -> Option<u8> {
    if value.is_empty() || value.starts_with('0') || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok().filter(|bits| (8..=MAX_WINDOW_BITS).contains(bits))
}

/// Validated permessage-deflate parameters.
///
/// A valueless `client_max_window_bits` in an offer means "any window is fine" and is stored as
/// 15, the largest window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
}

impl DeflateParams {
    /// Validates an offer (or a response) against the parameter table.
    pub fn from_offer(offer: &ExtensionOffer) -> std::result::Result<Self, NegotiationError> {
        if offer.token != PERMESSAGE_DEFLATE {
            return Err(NegotiationError::UnknownExtension(offer.token.clone()));
        }

        let mut params = Self::default();
        let mut seen = [false; DEFLATE_PARAMETERS.len()];

        for param in &offer.params {
            let index = DEFLATE_PARAMETERS
                .iter()
                .position(|(name, _)| *name == param.name)
                .ok_or_else(|| NegotiationError::InvalidParameter(param.name.clone()))?;
            if std::mem::replace(&mut seen[index], true) {
                return Err(NegotiationError::DuplicateParameter(param.name.clone()));
            }

            let invalid = || {
                NegotiationError::InvalidParameter(match &param.value {
                    Some(value) => format!("{}={value}", param.name),
                    None => param.name.clone(),
                })
            };
            let bits = match (DEFLATE_PARAMETERS[index].1, param.value.as_deref()) {
                (ValueRule::Absent, None) => None,
                (ValueRule::OptionalWindowBits, None) => Some(MAX_WINDOW_BITS),
                (ValueRule::WindowBits | ValueRule::OptionalWindowBits, Some(value)) => {
                    Some(parse_window_bits(value).ok_or_else(invalid)?)
                }
                _ => return Err(invalid()),
            };

            match index {
                0 => params.server_no_context_takeover = true,
                1 => params.client_no_context_takeover = true,
                2 => params.server_max_window_bits = bits,
                _ => params.client_max_window_bits = bits,
            }
        }

        Ok(params)
    }

    /// The parameters as an offer, in table order.
    pub fn to_offer(&self) -> ExtensionOffer {
        let mut offer = ExtensionOffer {
            token: PERMESSAGE_DEFLATE.to_owned(),
            params: Vec::new(),
        };
        if self.server_no_context_takeover {
            offer = offer.with_param("server_no_context_takeover", None);
        }
        if self.client_no_context_takeover {
            offer = offer.with_param("client_no_context_takeover", None);
        }
        if let Some(bits) = self.server_max_window_bits {
            offer = offer.with_param("server_max_window_bits", Some(bits));
        }
        if let Some(bits) = self.client_max_window_bits {
            offer = offer.with_param("client_max_window_bits", Some(bits));
        }
        offer
    }
}

/// Whether this build can compress with a window of `bits`. zlib has no 256-byte raw window,
/// so 8 is never honoured.
fn window_supported(bits: u8) -> bool {
    bits == MAX_WINDOW_BITS || (cfg!(feature = "zlib") && bits >= 9)
}

/// The offer a client sends for the given options.
///
/// A valueless `client_max_window_bits` is only advertised when the window can actually be
/// shrunk, i.e. with the `zlib` feature.
pub fn client_offer(options: &DeflateOptions) -> ExtensionOffer {
    let mut offer = ExtensionOffer {
        token: PERMESSAGE_DEFLATE.to_owned(),
        params: Vec::new(),
    };
    if options.server_no_context_takeover {
        offer = offer.with_param("server_no_context_takeover", None);
    }
    if options.client_no_context_takeover {
        offer = offer.with_param("client_no_context_takeover", None);
    }
    if let Some(bits) = options.server_max_window_bits {
        offer = offer.with_param("server_max_window_bits", Some(bits));
    }
    if cfg!(feature = "zlib") {
        offer = offer.with_param("client_max_window_bits", options.client_max_window_bits);
    }
    offer
}

/// Server agreement policy for one validated offer.
///
/// Context takeover is disabled if either side asks for it, window sizes are the smaller of
/// what the client asks for and what the server is configured with. Returns `None` to decline
/// an offer this build cannot honour.
pub fn agree_server(offered: &DeflateParams, local: &DeflateOptions) -> Option<DeflateParams> {
    let server_max_window_bits =
        match (offered.server_max_window_bits, local.server_max_window_bits) {
            (Some(c), Some(s)) => Some(c.min(s)),
            (c, s) => c.or(s),
        };
    if server_max_window_bits.is_some_and(|bits| !window_supported(bits)) {
        #[cfg(feature = "logging")]
        log::warn!(
            "declining permessage-deflate: server_max_window_bits={server_max_window_bits:?} \
             needs the `zlib` feature"
        );
        return None;
    }

    // client_max_window_bits may only be answered when the client offered it
    let client_max_window_bits =
        match (offered.client_max_window_bits, local.client_max_window_bits) {
            (Some(c), Some(s)) => Some(c.min(s)),
            (Some(c), None) if c < MAX_WINDOW_BITS => Some(c),
            _ => None,
        };

    Some(DeflateParams {
        server_no_context_takeover: offered.server_no_context_takeover
            || local.server_no_context_takeover,
        client_no_context_takeover: offered.client_no_context_takeover
            || local.client_no_context_takeover,
        server_max_window_bits,
        client_max_window_bits,
    })
}

/// Client agreement policy: checks the server's response against the offer made from `local`.
pub fn agree_client(
    response: &ExtensionOffer,
    local: &DeflateOptions,
) -> std::result::Result<DeflateParams, NegotiationError> {
    let agreed = DeflateParams::from_offer(response)?;

    if let Some(param) = response.param("client_max_window_bits") {
        // must carry a value and may only answer an offer we made
        if param.value.is_none() || !cfg!(feature = "zlib") {
            return Err(NegotiationError::InvalidParameter(param.name.clone()));
        }
    }
    if let (Some(asked), Some(got)) = (
        local.server_max_window_bits,
        agreed.server_max_window_bits,
    ) {
        if got > asked {
            return Err(NegotiationError::InvalidParameter(format!(
                "server_max_window_bits={got}"
            )));
        }
    }
    if local.server_no_context_takeover && !agreed.server_no_context_takeover {
        return Err(NegotiationError::InvalidParameter(
            "server_no_context_takeover".to_owned(),
        ));
    }

    Ok(DeflateParams {
        client_no_context_takeover: agreed.client_no_context_takeover
            || local.client_no_context_takeover,
        client_max_window_bits: agreed
            .client_max_window_bits
            .or(local.client_max_window_bits.filter(|_| cfg!(feature = "zlib"))),
        ..agreed
    })
}

/// An extension in force on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    PerMessageDeflate(DeflateParams),
}

impl Extension {
    /// Registered token.
    pub fn token(&self) -> &'static str {
        match self {
            Extension::PerMessageDeflate(_) => PERMESSAGE_DEFLATE,
        }
    }

    /// RSV bits this extension uses, in byte-0 positions.
    pub fn rsv_mask(&self) -> u8 {
        match self {
            Extension::PerMessageDeflate(_) => RSV1,
        }
    }

    /// How the extension is written in a response header.
    pub fn to_offer(&self) -> ExtensionOffer {
        match self {
            Extension::PerMessageDeflate(params) => params.to_offer(),
        }
    }
}

/// The ordered set of extensions agreed for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedExtensions {
    extensions: Vec<Extension>,
}

impl NegotiatedExtensions {
    /// Adds an extension after the ones already agreed.
    ///
    /// Fails with [`NegotiationError::RsvConflict`] if it wants an RSV bit that is taken.
    pub fn push(&mut self, extension: Extension) -> std::result::Result<(), NegotiationError> {
        if self.rsv_mask() & extension.rsv_mask() != 0 {
            return Err(NegotiationError::RsvConflict(extension.token().to_owned()));
        }
        self.extensions.push(extension);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.extensions.iter()
    }

    /// Union of the RSV bits claimed by every extension.
    pub fn rsv_mask(&self) -> u8 {
        self.extensions.iter().fold(0, |mask, ext| mask | ext.rsv_mask())
    }

    /// The agreed permessage-deflate parameters, if any.
    pub fn deflate(&self) -> Option<&DeflateParams> {
        self.extensions.iter().find_map(|ext| match ext {
            Extension::PerMessageDeflate(params) => Some(params),
        })
    }

    /// Value for the `Sec-WebSocket-Extensions` response header.
    pub fn header_value(&self) -> Option<String> {
        if self.extensions.is_empty() {
            return None;
        }
        let offers: Vec<String> = self
            .extensions
            .iter()
            .map(|ext| ext.to_offer().to_string())
            .collect();
        Some(offers.join(", "))
    }

    /// Builds the transforms for outgoing messages, in registration order.
    pub fn outbound(&self, role: Role, level: CompressionLevel) -> Outbound {
        let transforms = self
            .extensions
            .iter()
            .map(|ext| match ext {
                Extension::PerMessageDeflate(params) => {
                    let (bits, no_context) = match role {
                        Role::Client => (
                            params.client_max_window_bits,
                            params.client_no_context_takeover,
                        ),
                        Role::Server => (
                            params.server_max_window_bits,
                            params.server_no_context_takeover,
                        ),
                    };
                    OutboundTransform::Deflate(Deflater::new(level, bits, no_context))
                }
            })
            .collect();
        Outbound { transforms }
    }

    /// Builds the transforms for incoming messages, limited to `max_message` bytes of output.
    pub fn inbound(&self, role: Role, max_message: usize) -> Inbound {
        let transforms = self
            .extensions
            .iter()
            .map(|ext| match ext {
                Extension::PerMessageDeflate(params) => {
                    let (bits, no_context) = match role {
                        Role::Client => (
                            params.server_max_window_bits,
                            params.server_no_context_takeover,
                        ),
                        Role::Server => (
                            params.client_max_window_bits,
                            params.client_no_context_takeover,
                        ),
                    };
                    InboundTransform::Inflate(Inflater::new(bits, no_context, max_message))
                }
            })
            .collect();
        Inbound { transforms }
    }
}

/// Server side negotiation for the `Sec-WebSocket-Extensions` request header.
///
/// Offers for unknown extensions are ignored and a permessage-deflate offer with invalid
/// parameters is declined, so the next offer gets a chance. The first acceptable offer wins.
/// Only a header that does not parse at all is an error.
pub fn negotiate_server(
    header: Option<&str>,
    local: Option<&DeflateOptions>,
) -> std::result::Result<NegotiatedExtensions, NegotiationError> {
    let mut negotiated = NegotiatedExtensions::default();
    let (Some(header), Some(local)) = (header, local) else {
        return Ok(negotiated);
    };

    for offer in ExtensionOffer::parse_list(header)? {
        match DeflateParams::from_offer(&offer) {
            Ok(params) => {
                if let Some(agreed) = agree_server(&params, local) {
                    #[cfg(feature = "logging")]
                    log::debug!("accepted extension offer: {}", agreed.to_offer());

                    negotiated.push(Extension::PerMessageDeflate(agreed))?;
                    break;
                }
            }
            Err(_err) => {
                #[cfg(feature = "logging")]
                log::debug!("declined extension offer {offer}: {_err}");
            }
        }
    }

    Ok(negotiated)
}

/// Client side negotiation for the `Sec-WebSocket-Extensions` response header.
///
/// Every extension in the response must be one the client offered.
pub fn negotiate_client(
    header: Option<&str>,
    offered: Option<&DeflateOptions>,
) -> std::result::Result<NegotiatedExtensions, NegotiationError> {
    let mut negotiated = NegotiatedExtensions::default();
    let Some(header) = header.filter(|h| !h.trim().is_empty()) else {
        return Ok(negotiated);
    };

    for response in ExtensionOffer::parse_list(header)? {
        let local = match offered {
            Some(local) if response.token == PERMESSAGE_DEFLATE => local,
            _ => return Err(NegotiationError::UnknownExtension(response.token)),
        };
        let agreed = agree_client(&response, local)?;

        #[cfg(feature = "logging")]
        log::debug!("server agreed to extension: {}", agreed.to_offer());

        negotiated.push(Extension::PerMessageDeflate(agreed))?;
    }

    Ok(negotiated)
}

enum OutboundTransform {
    Deflate(Deflater),
}

/// Stateful transforms applied to every outgoing data message.
pub struct Outbound {
    transforms: Vec<OutboundTransform>,
}

impl Outbound {
    /// A pass-through transform chain.
    pub fn none() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Runs every transform in registration order.
    ///
    /// # Returns
    /// The transformed payload and the RSV bits the first frame of the message must carry.
    pub fn apply(&mut self, payload: &[u8]) -> Result<(BytesMut, u8)> {
        let mut payload = BytesMut::from(payload);
        let mut rsv = 0;
        for transform in &mut self.transforms {
            match transform {
                OutboundTransform::Deflate(deflater) => {
                    payload = deflater.compress(&payload)?;
                    rsv |= RSV1;
                }
            }
        }
        Ok((payload, rsv))
    }
}

enum InboundTransform {
    Inflate(Inflater),
}

/// Stateful transforms applied to every incoming data message.
pub struct Inbound {
    transforms: Vec<InboundTransform>,
}

impl Inbound {
    /// A pass-through transform chain.
    pub fn none() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    /// Undoes the transforms in reverse registration order. A transform only runs when the
    /// message carries its RSV bit.
    ///
    /// Fails with [`WebSocketError::CompressionNotSupported`] if the message is marked
    /// compressed but nothing was negotiated to inflate it.
    pub fn apply(&mut self, rsv: u8, mut payload: BytesMut) -> Result<BytesMut> {
        if rsv & RSV1 != 0 && self.transforms.is_empty() {
            return Err(WebSocketError::CompressionNotSupported);
        }
        for transform in self.transforms.iter_mut().rev() {
            match transform {
                InboundTransform::Inflate(inflater) if rsv & RSV1 != 0 => {
                    payload = inflater.decompress(&payload)?;
                }
                InboundTransform::Inflate(_) => {}
            }
        }
        Ok(payload)
    }
}
