//! Entity capabilities cache.
//!
//! Entities advertise a hash of their identities and features in presence.
//! We ask for the full feature list once per hash, recompute the hash from
//! the answer, and only keep answers whose hash matches the claim.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use palaver_protocol::Element;
use palaver_protocol::ns::{NS_CAPS, NS_CLIENT, NS_DATA_FORMS, NS_DISCO_INFO};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::connection::ConnectionId;

/// Features we never assume an entity supports until it says so.
pub const DEFAULT_FEATURE_BLACKLIST: &[&str] = &[
    "http://jabber.org/protocol/chatstates",
    "http://jabber.org/protocol/xhtml-im",
    "http://www.xmpp.org/extensions/xep-0116.html#ns",
    "urn:xmpp:jingle:transports:ice-udp:1",
    "urn:xmpp:jingle:apps:rtp:audio",
    "urn:xmpp:jingle:apps:rtp:video",
    "urn:xmpp:jingle:apps:file-transfer:5",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Md5,
}

impl HashAlgorithm {
    /// Parses the name used on the wire (`sha-1`, `sha-256`, `md5`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha-1" => Some(Self::Sha1),
            "sha-256" => Some(Self::Sha256),
            "md5" => Some(Self::Md5),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha-1",
            Self::Sha256 => "sha-256",
            Self::Md5 => "md5",
        }
    }

    fn digest(self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(input).to_vec(),
            Self::Sha256 => Sha256::digest(input).to_vec(),
            Self::Md5 => md5::compute(input).0.to_vec(),
        }
    }
}

/// Cache key: the algorithm name as advertised plus the hash value.
///
/// The algorithm stays a string so entries for algorithms we cannot
/// compute can still be tracked (they just never verify).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapsKey {
    pub algorithm: String,
    pub hash: String,
}

impl CapsKey {
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        }
    }

    /// Key shared by every entity that advertised no caps at all.
    pub fn unadvertised() -> Self {
        Self::new("dummy", "")
    }
}

impl fmt::Display for CapsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

/// Caps an entity claimed in a presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedCaps {
    pub node: String,
    pub key: CapsKey,
}

impl ClaimedCaps {
    /// Reads the `<c/>` child of a presence. Legacy caps without a `hash`
    /// attribute are ignored.
    pub fn from_presence(presence: &Element) -> Option<Self> {
        let c = presence.child("c", NS_CAPS)?;
        Some(Self {
            node: c.attr("node")?.to_string(),
            key: CapsKey::new(c.attr("hash")?, c.attr("ver")?),
        })
    }

    /// The disco node to query: `node#ver`.
    pub fn disco_node(&self) -> String {
        format!("{}#{}", self.node, self.key.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub lang: Option<String>,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(category: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            kind: kind.into(),
            lang: None,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            category: el.attr("category")?.to_string(),
            kind: el.attr("type")?.to_string(),
            lang: el.attr("xml:lang").map(str::to_string),
            name: el.attr("name").map(str::to_string),
        })
    }

    fn sort_key(&self) -> (&str, &str, &str, &str) {
        (
            &self.category,
            &self.kind,
            self.lang.as_deref().unwrap_or(""),
            self.name.as_deref().unwrap_or(""),
        )
    }
}

const FORM_TYPE: &str = "FORM_TYPE";

/// An extended info form (`jabber:x:data`) from a disco answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataForm {
    /// Values by field `var`, `FORM_TYPE` included.
    pub fields: BTreeMap<String, Vec<String>>,
}

impl DataForm {
    pub fn with_field<I, V>(mut self, var: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.fields
            .insert(var.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn form_type(&self) -> Option<&str> {
        self.fields
            .get(FORM_TYPE)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn from_element(el: &Element) -> Self {
        let mut form = Self::default();
        for field in el.children().filter(|c| c.is("field", NS_DATA_FORMS)) {
            let Some(var) = field.attr("var") else {
                continue;
            };
            let values = field
                .children()
                .filter(|v| v.is("value", NS_DATA_FORMS))
                .map(Element::text)
                .collect();
            form.fields.insert(var.to_string(), values);
        }
        form
    }
}

/// Everything a disco#info answer says about an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoInfo {
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
    pub forms: Vec<DataForm>,
}

/// Computes the capabilities hash of an identity and feature set.
///
/// Identities are ordered by category, type, language and name, features
/// byte-wise; each item is terminated by `<` and the digest is base64.
/// Forms follow, ordered by `FORM_TYPE`: the form type, then every other
/// field by `var` with its sorted values.
pub fn compute_caps_hash(
    algorithm: HashAlgorithm,
    identities: &[Identity],
    features: &[String],
    forms: &[DataForm],
) -> String {
    let mut identities: Vec<&Identity> = identities.iter().collect();
    identities.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let mut features: Vec<&str> = features.iter().map(String::as_str).collect();
    features.sort_unstable();

    let mut input = String::new();
    for identity in identities {
        let (category, kind, lang, name) = identity.sort_key();
        input.push_str(&format!("{category}/{kind}/{lang}/{name}<"));
    }
    for feature in features {
        input.push_str(feature);
        input.push('<');
    }

    let mut forms: Vec<&DataForm> = forms.iter().collect();
    forms.sort_by(|a, b| a.form_type().unwrap_or("").cmp(b.form_type().unwrap_or("")));
    for form in forms {
        if let Some(form_type) = form.form_type() {
            input.push_str(form_type);
            input.push('<');
        }
        for (var, values) in form.fields.iter().filter(|(var, _)| *var != FORM_TYPE) {
            input.push_str(var);
            input.push('<');
            let mut values: Vec<&str> = values.iter().map(String::as_str).collect();
            values.sort_unstable();
            for value in values {
                input.push_str(value);
                input.push('<');
            }
        }
    }
    STANDARD.encode(algorithm.digest(input.as_bytes()))
}

/// Builds a disco#info request for `node` on `entity`.
pub fn disco_info_request(entity: &str, node: &str) -> Element {
    Element::new("iq", NS_CLIENT)
        .with_attr("type", "get")
        .with_attr("to", entity)
        .with_child(Element::new("query", NS_DISCO_INFO).with_attr("node", node))
}

/// Pulls identities, features and extended info forms out of a disco#info
/// result.
pub fn parse_disco_info(response: &Element) -> Option<DiscoInfo> {
    let query = if response.is("query", NS_DISCO_INFO) {
        response
    } else {
        response.child("query", NS_DISCO_INFO)?
    };
    let mut info = DiscoInfo::default();
    for child in query.children() {
        if child.is("identity", NS_DISCO_INFO) {
            info.identities.extend(Identity::from_element(child));
        } else if child.is("feature", NS_DISCO_INFO) {
            if let Some(var) = child.attr("var") {
                info.features.push(var.to_string());
            }
        } else if child.is("x", NS_DATA_FORMS) {
            info.forms.push(DataForm::from_element(child));
        }
    }
    Some(info)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsStatus {
    New,
    Queried,
    /// Answer received and verified.
    Cached,
    /// Stands in for entities without caps; behaves as known but empty.
    Faked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapsEntry {
    pub key: CapsKey,
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
    pub status: CapsStatus,
    pub last_seen: Option<DateTime<Utc>>,
    recently_seen: bool,
}

impl CapsEntry {
    fn new(key: CapsKey) -> Self {
        let status = if key == CapsKey::unadvertised() {
            CapsStatus::Faked
        } else {
            CapsStatus::New
        };
        Self {
            key,
            identities: Vec::new(),
            features: Vec::new(),
            status,
            last_seen: None,
            recently_seen: false,
        }
    }

    /// Identities and features are known.
    pub fn is_valid(&self) -> bool {
        matches!(self.status, CapsStatus::Cached | CapsStatus::Faked)
    }
}

/// A verified entry as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCaps {
    pub key: CapsKey,
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
}

/// Persistence for verified entries.
pub trait CapsStore {
    fn store(&mut self, key: &CapsKey, identities: &[Identity], features: &[String]);

    fn iter_cached_entries(&self) -> Box<dyn Iterator<Item = StoredCaps> + '_>;

    /// Records that an entry was in use.
    fn update_last_seen(&mut self, _key: &CapsKey, _when: DateTime<Utc>) {}
}

#[derive(Debug, Default)]
pub struct MemoryCapsStore {
    entries: BTreeMap<CapsKey, StoredCaps>,
    seen: BTreeMap<CapsKey, DateTime<Utc>>,
}

impl MemoryCapsStore {
    pub fn last_seen(&self, key: &CapsKey) -> Option<DateTime<Utc>> {
        self.seen.get(key).copied()
    }
}

impl CapsStore for MemoryCapsStore {
    fn store(&mut self, key: &CapsKey, identities: &[Identity], features: &[String]) {
        self.entries.insert(
            key.clone(),
            StoredCaps {
                key: key.clone(),
                identities: identities.to_vec(),
                features: features.to_vec(),
            },
        );
    }

    fn iter_cached_entries(&self) -> Box<dyn Iterator<Item = StoredCaps> + '_> {
        Box::new(self.entries.values().cloned())
    }

    fn update_last_seen(&mut self, key: &CapsKey, when: DateTime<Utc>) {
        self.seen.insert(key.clone(), when);
    }
}

/// A disco#info query the engine should send.
#[derive(Debug, Clone, PartialEq)]
pub struct CapsQuery {
    pub connection: ConnectionId,
    pub entity: String,
    pub key: CapsKey,
    pub request: Element,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Mismatch { computed: String },
    UnsupportedAlgorithm,
}

/// Capability cache keyed by (algorithm, hash).
pub struct CapabilityCache {
    entries: HashMap<CapsKey, CapsEntry>,
    store: Box<dyn CapsStore>,
    blacklist: Vec<String>,
}

impl fmt::Debug for CapabilityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityCache")
            .field("entries", &self.entries.len())
            .field("blacklist", &self.blacklist)
            .finish()
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new(
            Box::new(MemoryCapsStore::default()),
            DEFAULT_FEATURE_BLACKLIST.iter().map(|f| f.to_string()).collect(),
        )
    }
}

impl CapabilityCache {
    pub fn new(store: Box<dyn CapsStore>, blacklist: Vec<String>) -> Self {
        Self {
            entries: HashMap::new(),
            store,
            blacklist,
        }
    }

    /// Loads every persisted entry as cached.
    pub fn initialize_from_store(&mut self) -> usize {
        let stored: Vec<StoredCaps> = self.store.iter_cached_entries().collect();
        let count = stored.len();
        for item in stored {
            let entry = self.lookup_or_create(&item.key);
            entry.identities = item.identities;
            entry.features = item.features;
            entry.status = CapsStatus::Cached;
        }
        debug!(entries = count, "loaded capability cache");
        count
    }

    pub fn lookup_or_create(&mut self, key: &CapsKey) -> &mut CapsEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CapsEntry::new(key.clone()))
    }

    pub fn get(&self, key: &CapsKey) -> Option<&CapsEntry> {
        self.entries.get(key)
    }

    /// Returns the disco query to send if nobody asked about this hash yet.
    /// Otherwise only refreshes the entry's last-seen time.
    pub fn query_if_unknown(
        &mut self,
        connection: ConnectionId,
        entity: &str,
        claimed: &ClaimedCaps,
    ) -> Option<CapsQuery> {
        let entry = self.lookup_or_create(&claimed.key);
        if entry.status != CapsStatus::New {
            self.mark_seen(&claimed.key);
            return None;
        }
        entry.status = CapsStatus::Queried;
        debug!(entity = %entity, key = %claimed.key, "querying capabilities");
        Some(CapsQuery {
            connection,
            entity: entity.to_string(),
            key: claimed.key.clone(),
            request: disco_info_request(entity, &claimed.disco_node()),
        })
    }

    /// Recomputes the hash of a disco answer and caches it only if it
    /// matches the claimed key.
    ///
    /// On mismatch the entry goes back to unknown with no features: lookups
    /// fall back to the blacklist default and the next entity claiming the
    /// same hash is asked again.
    pub fn verify_and_store(&mut self, key: &CapsKey, info: DiscoInfo) -> Verification {
        let DiscoInfo {
            identities,
            features,
            forms,
        } = info;
        let verdict = match HashAlgorithm::from_name(&key.algorithm) {
            None => Verification::UnsupportedAlgorithm,
            Some(algorithm) => {
                let computed = compute_caps_hash(algorithm, &identities, &features, &forms);
                if computed == key.hash {
                    Verification::Verified
                } else {
                    Verification::Mismatch { computed }
                }
            }
        };

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CapsEntry::new(key.clone()));
        match &verdict {
            Verification::Verified => {
                entry.identities = identities;
                entry.features = features;
                entry.status = CapsStatus::Cached;
                self.store.store(key, &entry.identities, &entry.features);
                info!(key = %key, "capabilities verified");
            }
            Verification::Mismatch { computed } => {
                entry.identities.clear();
                entry.features.clear();
                entry.status = CapsStatus::New;
                warn!(key = %key, computed = %computed, "capabilities hash mismatch, discarding answer");
            }
            Verification::UnsupportedAlgorithm => {
                entry.identities.clear();
                entry.features.clear();
                warn!(key = %key, "cannot verify capabilities hash algorithm");
            }
        }
        verdict
    }

    /// The query for `key` failed; allow a later presence to ask again.
    pub fn on_query_failed(&mut self, key: &CapsKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.status == CapsStatus::Queried {
                entry.status = CapsStatus::New;
            }
        }
    }

    /// Whether an entity with caps `key` supports `feature`.
    ///
    /// Unknown entities are assumed to support everything except
    /// blacklisted features.
    pub fn client_supports(&self, key: &CapsKey, feature: &str) -> bool {
        let (features, status) = match self.entries.get(key) {
            Some(entry) => (entry.features.as_slice(), entry.status),
            None => (&[][..], CapsStatus::New),
        };
        if features.iter().any(|f| f == feature) {
            return true;
        }
        if features.is_empty() && status != CapsStatus::Cached {
            return !self.blacklist.iter().any(|f| f == feature);
        }
        false
    }

    /// Updates the last-seen time, at most once per session.
    pub fn mark_seen(&mut self, key: &CapsKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.recently_seen {
            return;
        }
        let now = Utc::now();
        entry.recently_seen = true;
        entry.last_seen = Some(now);
        if entry.status != CapsStatus::Faked {
            self.store.update_last_seen(key, now);
        }
    }

    pub fn forget(&mut self, key: &CapsKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
