use rand::RngCore;
use serde::{Deserialize, Serialize, de};
use std::{
    fmt::{self, Write},
    str::FromStr,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Copy, Clone)]
pub enum ValueError {
    #[error("invalid OID")]
    InvalidOid,
    #[error("invalid size")]
    InvalidSize,
    #[error("invalid hash algorithm")]
    InvalidHashAlgorithm,
    #[error("invalid storage key")]
    InvalidStorageKey,
    #[error("invalid repository identifier")]
    InvalidRepositoryIdentifier,
    #[error("operation should be 'download' or 'upload'")]
    InvalidOperation,
    #[error("user subject must not be empty")]
    EmptySubject,
}

// ---------------------------- Operation ----------------------------

#[derive(Debug, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operation {
    #[serde(rename = "download")]
    Download = 1,
    #[serde(rename = "upload")]
    Upload = 2,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

impl FromStr for Operation {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            _ => Err(ValueError::InvalidOperation),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------- OID -------------------------------

/// None means out of range.
fn decode_nibble(c: u8) -> Option<u8> {
    if c.is_ascii_digit() {
        Some(c - b'0')
    } else if (b'a'..=b'f').contains(&c) {
        Some(c - b'a' + 10)
    } else if (b'A'..=b'F').contains(&c) {
        Some(c - b'A' + 10)
    } else {
        None
    }
}

/// A 64-character hexadecimal content hash.
///
/// The case of the hex digits is kept exactly as given; two OIDs that differ
/// only in case are different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(String);

impl Oid {
    pub const LEN: usize = 64;

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Oid {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::LEN || !s.bytes().all(|c| decode_nibble(c).is_some()) {
            return Err(ValueError::InvalidOid);
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Oid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Oid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ------------------------------- Size ------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Size(u64);

impl Size {
    pub fn new(value: i64) -> Result<Self, ValueError> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| ValueError::InvalidSize)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Size {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

// -------------------------- Hash algorithm -------------------------

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "sha256")]
    Sha256,
}

impl HashAlgorithm {
    /// An empty string selects the default algorithm. Names are not case-folded.
    pub fn parse(s: &str) -> Result<Self, ValueError> {
        match s {
            "" | "sha256" => Ok(Self::Sha256),
            _ => Err(ValueError::InvalidHashAlgorithm),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --------------------------- Storage key ---------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ValueError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ValueError::InvalidStorageKey);
        }
        Ok(Self(key))
    }

    /// Builds `objects/<algo>/<oid[0:2]>/<oid[2:4]>/<oid>`.
    pub fn for_object(oid: &Oid, algo: &str) -> Result<Self, ValueError> {
        let algo = HashAlgorithm::parse(algo).map_err(|_| ValueError::InvalidStorageKey)?;
        let oid = oid.as_str();
        Self::new(format!(
            "objects/{algo}/{}/{}/{oid}",
            &oid[0..2],
            &oid[2..4]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StorageKey {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StorageKey> for String {
    fn from(value: StorageKey) -> Self {
        value.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------- Repository identifier ----------------------

/// An `owner/name` pair. `PartialEq` is case-sensitive; use
/// [`RepositoryIdentifier::equals_fold`] for case-insensitive comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryIdentifier {
    owner: String,
    name: String,
}

impl RepositoryIdentifier {
    pub fn new(owner: &str, name: &str) -> Result<Self, ValueError> {
        if owner.is_empty() || name.is_empty() || owner.contains('/') || name.contains('/') {
            return Err(ValueError::InvalidRepositoryIdentifier);
        }
        Ok(Self {
            owner: owner.to_owned(),
            name: name.to_owned(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn equals_fold(&self, other: &Self) -> bool {
        fold_eq(&self.owner, &other.owner) && fold_eq(&self.name, &other.name)
    }
}

fn fold_eq(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

impl FromStr for RepositoryIdentifier {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, name) = s
            .split_once('/')
            .ok_or(ValueError::InvalidRepositoryIdentifier)?;
        Self::new(owner, name)
    }
}

impl TryFrom<String> for RepositoryIdentifier {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RepositoryIdentifier> for String {
    fn from(value: RepositoryIdentifier) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RepositoryIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

// ------------------------- Permissions -----------------------------

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryPermissions {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub pull: bool,
    #[serde(default)]
    pub maintain: bool,
    #[serde(default)]
    pub triage: bool,
}

impl RepositoryPermissions {
    pub const fn full() -> Self {
        Self {
            admin: true,
            push: true,
            pull: true,
            maintain: true,
            triage: true,
        }
    }

    pub fn can_upload(&self) -> bool {
        self.push || self.admin || self.maintain
    }

    pub fn can_download(&self) -> bool {
        self.pull || self.push || self.admin || self.maintain || self.triage
    }

    pub fn allows(&self, operation: Operation) -> bool {
        match operation {
            Operation::Upload => self.can_upload(),
            Operation::Download => self.can_download(),
        }
    }
}

// ----------------------------- Identity ----------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "github")]
    GitHub,
}

/// The authenticated caller of a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    sub: String,
    email: String,
    name: String,
    provider: Provider,
    repository: Option<RepositoryIdentifier>,
    git_ref: String,
    permissions: Option<RepositoryPermissions>,
}

impl UserInfo {
    pub fn new(
        sub: impl Into<String>,
        email: impl Into<String>,
        name: impl Into<String>,
        provider: Provider,
    ) -> Result<Self, ValueError> {
        let sub = sub.into();
        if sub.is_empty() {
            return Err(ValueError::EmptySubject);
        }
        Ok(Self {
            sub,
            email: email.into(),
            name: name.into(),
            provider,
            repository: None,
            git_ref: String::new(),
            permissions: None,
        })
    }

    pub fn with_repository(mut self, repository: RepositoryIdentifier) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = git_ref.into();
        self
    }

    pub fn with_permissions(mut self, permissions: RepositoryPermissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn sub(&self) -> &str {
        &self.sub
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn repository(&self) -> Option<&RepositoryIdentifier> {
        self.repository.as_ref()
    }

    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }

    pub fn permissions(&self) -> Option<&RepositoryPermissions> {
        self.permissions.as_ref()
    }
}

// ---------------------------- Formatting ---------------------------

pub struct HexFmt<B: AsRef<[u8]>>(pub B);

impl<B: AsRef<[u8]>> fmt::Display for HexFmt<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let HexFmt(buf) = self;
        for b in buf.as_ref() {
            let (high, low) = (b >> 4, b & 0xF);
            let highc = if high < 10 {
                high + b'0'
            } else {
                high - 10 + b'a'
            };
            let lowc = if low < 10 {
                low + b'0'
            } else {
                low - 10 + b'a'
            };
            f.write_char(highc as char)?;
            f.write_char(lowc as char)?;
        }
        Ok(())
    }
}

pub struct EscHtmlFmt<'a>(pub &'a str);

impl fmt::Display for EscHtmlFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let EscHtmlFmt(buf) = self;
        for c in buf.chars() {
            match c {
                '&' => f.write_str("&amp;")?,
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&#39;")?,
                _ => f.write_char(c)?,
            };
        }
        Ok(())
    }
}

/// 32 random bytes from the thread-local CSPRNG, hex encoded.
pub fn random_token() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    HexFmt(buf).to_string()
}

#[test]
fn test_oid() {
    let lower = "a".repeat(64);
    let upper = "A".repeat(64);
    assert!(lower.parse::<Oid>().is_ok());
    assert!(upper.parse::<Oid>().is_ok());
    assert_ne!(lower.parse::<Oid>().unwrap(), upper.parse::<Oid>().unwrap());
    assert_eq!(upper.parse::<Oid>().unwrap().as_str(), upper);
    assert_eq!("a".repeat(63).parse::<Oid>(), Err(ValueError::InvalidOid));
    assert_eq!("a".repeat(65).parse::<Oid>(), Err(ValueError::InvalidOid));
    assert_eq!(
        format!("{}g", "a".repeat(63)).parse::<Oid>(),
        Err(ValueError::InvalidOid)
    );
    assert_eq!("".parse::<Oid>(), Err(ValueError::InvalidOid));
}

#[test]
fn test_size() {
    assert_eq!(Size::new(0).unwrap().get(), 0);
    assert_eq!(Size::new(1024).unwrap().get(), 1024);
    assert_eq!(Size::new(-1), Err(ValueError::InvalidSize));
}

#[test]
fn test_hash_algorithm() {
    assert_eq!(HashAlgorithm::parse(""), Ok(HashAlgorithm::Sha256));
    assert_eq!(HashAlgorithm::parse("sha256"), Ok(HashAlgorithm::Sha256));
    assert_eq!(
        HashAlgorithm::parse("SHA256"),
        Err(ValueError::InvalidHashAlgorithm)
    );
    assert_eq!(
        HashAlgorithm::parse("sha1"),
        Err(ValueError::InvalidHashAlgorithm)
    );
}

#[test]
fn test_storage_key() {
    let oid: Oid = "8f4123f9a7181f488c5e111d82cefd992e461ae5df01fd2254399e6e670b2d3c"
        .parse()
        .unwrap();
    let key = StorageKey::for_object(&oid, "sha256").unwrap();
    assert_eq!(
        key.as_str(),
        "objects/sha256/8f/41/8f4123f9a7181f488c5e111d82cefd992e461ae5df01fd2254399e6e670b2d3c"
    );
    assert_eq!(
        StorageKey::for_object(&oid, "md5"),
        Err(ValueError::InvalidStorageKey)
    );
    assert_eq!(StorageKey::new(""), Err(ValueError::InvalidStorageKey));
}

#[test]
fn test_repository_identifier() {
    let repo: RepositoryIdentifier = "owner/repo".parse().unwrap();
    assert_eq!(repo.owner(), "owner");
    assert_eq!(repo.name(), "repo");
    assert_eq!(repo.to_string(), "owner/repo");

    for bad in ["", "owner", "/repo", "owner/", "owner/repo/extra", "/"] {
        assert_eq!(
            bad.parse::<RepositoryIdentifier>(),
            Err(ValueError::InvalidRepositoryIdentifier),
            "{bad}"
        );
    }

    let upper: RepositoryIdentifier = "Owner/Repo".parse().unwrap();
    assert_ne!(repo, upper);
    assert!(repo.equals_fold(&upper));
    assert!(upper.equals_fold(&repo));
    assert!(repo.equals_fold(&repo));
    assert!(!repo.equals_fold(&"owner/other".parse().unwrap()));

    let unicode: RepositoryIdentifier = "ÄRGER/Straße".parse().unwrap();
    assert!(unicode.equals_fold(&"ärger/straße".parse().unwrap()));
}

#[test]
fn test_permissions() {
    let none = RepositoryPermissions::default();
    assert!(!none.can_upload());
    assert!(!none.can_download());

    let triage = RepositoryPermissions {
        triage: true,
        ..Default::default()
    };
    assert!(!triage.can_upload());
    assert!(triage.can_download());

    let maintain = RepositoryPermissions {
        maintain: true,
        ..Default::default()
    };
    assert!(maintain.can_upload());
    assert!(maintain.can_download());
    assert!(maintain.allows(Operation::Upload));

    let full = RepositoryPermissions::full();
    assert!(full.can_upload() && full.can_download());
}

#[test]
fn test_user_info() {
    assert_eq!(
        UserInfo::new("", "", "", Provider::GitHub),
        Err(ValueError::EmptySubject)
    );
    let user = UserInfo::new("42", "", "Octo Cat", Provider::GitHub)
        .unwrap()
        .with_repository("octo/cat".parse().unwrap())
        .with_ref("refs/heads/main");
    assert_eq!(user.sub(), "42");
    assert_eq!(user.repository().unwrap().to_string(), "octo/cat");
    assert_eq!(user.git_ref(), "refs/heads/main");
    assert!(user.permissions().is_none());
}

#[test]
fn test_operation() {
    assert_eq!("upload".parse(), Ok(Operation::Upload));
    assert_eq!("download".parse(), Ok(Operation::Download));
    assert_eq!("Upload".parse::<Operation>(), Err(ValueError::InvalidOperation));
    assert_eq!("".parse::<Operation>(), Err(ValueError::InvalidOperation));
}

#[test]
fn test_esc_html() {
    assert_eq!(
        EscHtmlFmt("<a href=\"x\">'&'</a>").to_string(),
        "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;"
    );
}

#[test]
fn test_random_token() {
    let a = random_token();
    let b = random_token();
    assert_eq!(a.len(), 64);
    assert_ne!(a, b);
}

#[test]
fn test_serde_repository() {
    let repo: RepositoryIdentifier = serde_json::from_str("\"owner/repo\"").unwrap();
    assert_eq!(serde_json::to_string(&repo).unwrap(), "\"owner/repo\"");
    assert!(serde_json::from_str::<RepositoryIdentifier>("\"nope\"").is_err());
}
