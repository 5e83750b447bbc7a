//! LDAP result codes.
//!
//! The numeric values are part of the protocol contract (RFC 4511 §4.1.9) and
//! are compared against real directory server responses, so they must never
//! change. Codes 200-203 are reserved locally for failures that never reach
//! the server.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

macro_rules! result_codes {
    ($($variant:ident = $code:literal => $label:literal,)*) => {
        /// Status code carried by every LDAP response.
        ///
        /// Codes outside the table are preserved as [`ResultCode::Unknown`].
        /// Build values with [`ResultCode::from_code`] so that known numbers
        /// always map to their named variant.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "u16", into = "u16")]
        pub enum ResultCode {
            $($variant,)*
            Unknown(u16),
        }

        impl ResultCode {
            /// Returns the numeric wire value.
            pub fn code(self) -> u16 {
                match self {
                    $(ResultCode::$variant => $code,)*
                    ResultCode::Unknown(code) => code,
                }
            }

            /// Maps a numeric value onto the table.
            pub fn from_code(code: u16) -> Self {
                match code {
                    $($code => ResultCode::$variant,)*
                    other => ResultCode::Unknown(other),
                }
            }

            fn label(self) -> Option<&'static str> {
                match self {
                    $(ResultCode::$variant => Some($label),)*
                    ResultCode::Unknown(_) => None,
                }
            }
        }
    };
}

result_codes! {
    Success = 0 => "Success",
    OperationsError = 1 => "Operations Error",
    ProtocolError = 2 => "Protocol Error",
    TimeLimitExceeded = 3 => "Time Limit Exceeded",
    SizeLimitExceeded = 4 => "Size Limit Exceeded",
    CompareFalse = 5 => "Compare False",
    CompareTrue = 6 => "Compare True",
    AuthMethodNotSupported = 7 => "Auth Method Not Supported",
    StrongAuthRequired = 8 => "Strong Auth Required",
    Referral = 10 => "Referral",
    AdminLimitExceeded = 11 => "Admin Limit Exceeded",
    UnavailableCriticalExtension = 12 => "Unavailable Critical Extension",
    ConfidentialityRequired = 13 => "Confidentiality Required",
    SaslBindInProgress = 14 => "Sasl Bind In Progress",
    NoSuchAttribute = 16 => "No Such Attribute",
    UndefinedAttributeType = 17 => "Undefined Attribute Type",
    InappropriateMatching = 18 => "Inappropriate Matching",
    ConstraintViolation = 19 => "Constraint Violation",
    AttributeOrValueExists = 20 => "Attribute Or Value Exists",
    InvalidAttributeSyntax = 21 => "Invalid Attribute Syntax",
    NoSuchObject = 32 => "No Such Object",
    AliasProblem = 33 => "Alias Problem",
    InvalidDnSyntax = 34 => "Invalid DN Syntax",
    AliasDereferencingProblem = 36 => "Alias Dereferencing Problem",
    InappropriateAuthentication = 48 => "Inappropriate Authentication",
    InvalidCredentials = 49 => "Invalid Credentials",
    InsufficientAccessRights = 50 => "Insufficient Access Rights",
    Busy = 51 => "Busy",
    Unavailable = 52 => "Unavailable",
    UnwillingToPerform = 53 => "Unwilling To Perform",
    LoopDetect = 54 => "Loop Detect",
    NamingViolation = 64 => "Naming Violation",
    ObjectClassViolation = 65 => "Object Class Violation",
    NotAllowedOnNonLeaf = 66 => "Not Allowed On Non Leaf",
    NotAllowedOnRdn = 67 => "Not Allowed On RDN",
    EntryAlreadyExists = 68 => "Entry Already Exists",
    ObjectClassModsProhibited = 69 => "Object Class Mods Prohibited",
    AffectsMultipleDsas = 71 => "Affects Multiple DSAs",
    Other = 80 => "Other",
    ErrorNetwork = 200 => "Network Error",
    ErrorFilterCompile = 201 => "Filter Compile Error",
    ErrorFilterDecompile = 202 => "Filter Decompile Error",
    ErrorDebugging = 203 => "Debugging Error",
}

impl ResultCode {
    /// Human-readable label; codes outside the table render as their number.
    pub fn description(self) -> Cow<'static, str> {
        match self.label() {
            Some(label) => Cow::Borrowed(label),
            None => Cow::Owned(self.code().to_string()),
        }
    }

    /// Success family: `success` and `compareTrue`.
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::CompareTrue)
    }

    pub fn is_referral(self) -> bool {
        self == ResultCode::Referral
    }

    /// Codes generated by this library rather than by a server.
    pub fn is_local(self) -> bool {
        (200..=203).contains(&self.code())
    }
}

/// Looks up the label for a raw numeric code. Never fails.
pub fn describe(code: u16) -> String {
    ResultCode::from_code(code).description().into_owned()
}

impl From<u16> for ResultCode {
    fn from(code: u16) -> Self {
        ResultCode::from_code(code)
    }
}

impl From<ResultCode> for u16 {
    fn from(code: ResultCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}
