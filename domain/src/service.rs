use std::collections::HashMap;
use std::time::SystemTime;

use uuid::Uuid;

use crate::token::{generate_unique, validate_custom};
use crate::validate::normalize_redirect;
use crate::{
    ApiKey, AuthContext, Clock, CoreError, Field, KeyId, KeyRepository, Link, LinkRepository,
    LinkVisit, ShortToken, TokenGenerator, Visitor,
};

/// Input to [`LinkService::shorten`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortenRequest {
    /// Caller-chosen token. Empty is treated as absent.
    pub custom: Option<String>,
    pub redirect_to: String,
    pub expires_at: Option<SystemTime>,
}

/// Partial update of a link. Absent fields are left untouched.
///
/// An `expires_at` of exactly the Unix epoch clears the expiry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkUpdate {
    pub redirect_to: Field<String>,
    pub shortened: Field<String>,
    pub expires_at: Field<SystemTime>,
    pub is_active: Field<bool>,
}

/// Owner identity echoed alongside link metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyOwner {
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkDetail {
    pub link: Link,
    /// `None` once the owning key has been deleted.
    pub owner: Option<KeyOwner>,
}

impl From<&ApiKey> for KeyOwner {
    fn from(k: &ApiKey) -> Self {
        Self {
            name: k.name.clone(),
            key: k.key.clone(),
        }
    }
}

/// Application service orchestrating the link lifecycle.
///
/// Generic over the key and link repositories, the token source and the
/// clock. Every authorized operation takes the caller's [`AuthContext`]
/// explicitly and re-resolves the key, so a key deactivated mid-session stops
/// working on its next call.
pub struct LinkService<K: KeyRepository, L: LinkRepository, G: TokenGenerator, C: Clock> {
    keys: K,
    links: L,
    tokens: G,
    clock: C,
    site_host: Option<String>,
}

impl<K, L, G, C> LinkService<K, L, G, C>
where
    K: KeyRepository,
    L: LinkRepository,
    G: TokenGenerator,
    C: Clock,
{
    pub fn new(keys: K, links: L, tokens: G, clock: C) -> Self {
        Self {
            keys,
            links,
            tokens,
            clock,
            site_host: None,
        }
    }

    /// Reject redirect targets on this host (the shortener's own domain).
    pub fn with_site_host(mut self, host: Option<String>) -> Self {
        self.site_host = host;
        self
    }

    fn caller(&self, ctx: &AuthContext) -> Result<ApiKey, CoreError> {
        match self.keys.find_by_key(&ctx.key)? {
            Some(k) if k.is_active => Ok(k),
            _ => Err(CoreError::Unauthorized),
        }
    }

    /// Admins bypass ownership; everyone else must own the link.
    fn authorize_owner(&self, ctx: &AuthContext, link: &Link) -> Result<(), CoreError> {
        let caller = self.caller(ctx)?;
        if caller.is_admin || caller.id == link.created_by {
            Ok(())
        } else {
            Err(CoreError::Unauthorized)
        }
    }

    fn lookup(&self, shortened: &str) -> Result<Link, CoreError> {
        let token = ShortToken::new(shortened).map_err(|_| CoreError::NotFound)?;
        self.links.get(&token)?.ok_or(CoreError::NotFound)
    }

    fn owners(&self) -> Result<HashMap<KeyId, KeyOwner>, CoreError> {
        Ok(self
            .keys
            .list_keys()?
            .iter()
            .map(|k| (k.id, KeyOwner::from(k)))
            .collect())
    }

    /// Create a link owned by the caller and return its token.
    pub fn shorten(&self, ctx: &AuthContext, req: ShortenRequest) -> Result<ShortToken, CoreError> {
        let caller = self.caller(ctx)?;
        let redirect_to = normalize_redirect(&req.redirect_to, self.site_host.as_deref())?;

        let token = match req.custom.as_deref().filter(|c| !c.is_empty()) {
            Some(custom) => validate_custom(&self.links, custom)?,
            None => generate_unique(&self.links, &self.tokens)?,
        };

        let link = Link::new(
            token.clone(),
            redirect_to,
            req.expires_at,
            caller.id,
            self.clock.now(),
        );
        match self.links.insert(link) {
            Ok(()) => Ok(token),
            // Lost a race on the same token between the check and the insert.
            Err(CoreError::AlreadyExists) => Err(CoreError::TokenTaken),
            Err(e) => Err(e),
        }
    }

    /// Link metadata with its owner's name and key. No ownership restriction.
    pub fn retrieve(&self, shortened: &str) -> Result<LinkDetail, CoreError> {
        let link = self.lookup(shortened)?;
        let owner = self
            .keys
            .find_by_id(link.created_by)?
            .as_ref()
            .map(KeyOwner::from);
        Ok(LinkDetail { link, owner })
    }

    /// Resolve a public redirect and record the visit.
    ///
    /// Only active links resolve. A link past its expiry that the sweep has
    /// not reached yet is treated as gone.
    pub fn resolve_redirect(&self, shortened: &str, visitor: Visitor) -> Result<String, CoreError> {
        let token = ShortToken::new(shortened).map_err(|_| CoreError::NotFound)?;
        let link = self.links.get_active(&token)?.ok_or(CoreError::NotFound)?;
        let now = self.clock.now();
        if link.is_expired(now) {
            return Err(CoreError::NotFound);
        }
        if link.redirect_to.is_empty() {
            return Err(CoreError::InvalidRedirect);
        }

        self.links.record_visit(LinkVisit {
            id: Uuid::new_v4(),
            link_id: link.id,
            visited_at: now,
            user_agent: visitor.user_agent,
            ip_address: visitor.ip_address,
            referrer: visitor.referrer,
        })?;
        Ok(link.redirect_to)
    }

    /// Hard-delete a link.
    pub fn delete(&self, ctx: &AuthContext, shortened: &str) -> Result<(), CoreError> {
        let link = self.lookup(shortened)?;
        self.authorize_owner(ctx, &link)?;
        self.links.delete(link.id)
    }

    pub fn update(
        &self,
        ctx: &AuthContext,
        shortened: &str,
        fields: LinkUpdate,
    ) -> Result<Link, CoreError> {
        let mut link = self.lookup(shortened)?;
        self.authorize_owner(ctx, &link)?;
        let current = link.shortened.clone();

        if let Field::Present(raw) = fields.redirect_to {
            link.redirect_to = normalize_redirect(&raw, self.site_host.as_deref())?;
        }
        if let Field::Present(new_token) = fields.shortened {
            if new_token != link.shortened.as_str() {
                link.shortened = validate_custom(&self.links, &new_token).map_err(|e| match e {
                    CoreError::TokenTaken => CoreError::Conflict,
                    other => other,
                })?;
            }
        }
        if let Field::Present(at) = fields.expires_at {
            link.expires_at = (at != SystemTime::UNIX_EPOCH).then_some(at);
        }
        if let Field::Present(active) = fields.is_active {
            link.is_active = active;
        }
        link.updated_at = self.clock.now();

        match self.links.update(&current, &link) {
            Ok(()) => Ok(link),
            Err(CoreError::AlreadyExists) => Err(CoreError::Conflict),
            Err(e) => Err(e),
        }
    }

    /// Every link. Admin only.
    pub fn retrieve_all(&self, ctx: &AuthContext) -> Result<Vec<LinkDetail>, CoreError> {
        let caller = self.caller(ctx)?;
        if !caller.is_admin {
            return Err(CoreError::Forbidden);
        }
        let owners = self.owners()?;
        Ok(self
            .links
            .list_all()?
            .into_iter()
            .map(|link| LinkDetail {
                owner: owners.get(&link.created_by).cloned(),
                link,
            })
            .collect())
    }

    /// Links owned by the key `target`. Non-admins may only ask about their
    /// own key.
    pub fn retrieve_all_by_key(
        &self,
        ctx: &AuthContext,
        target: &str,
    ) -> Result<Vec<LinkDetail>, CoreError> {
        let caller = self.caller(ctx)?;
        if !caller.is_admin && caller.key != target {
            return Err(CoreError::Unauthorized);
        }
        let owner = self.keys.find_by_key(target)?.ok_or(CoreError::NotFound)?;
        let echoed = KeyOwner::from(&owner);
        Ok(self
            .links
            .list_by_owner(owner.id)?
            .into_iter()
            .map(|link| LinkDetail {
                link,
                owner: Some(echoed.clone()),
            })
            .collect())
    }

    /// Visit history of a link, for the owner or an admin.
    pub fn visits(&self, ctx: &AuthContext, shortened: &str) -> Result<Vec<LinkVisit>, CoreError> {
        let link = self.lookup(shortened)?;
        self.authorize_owner(ctx, &link)?;
        self.links.list_visits(link.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::InMemoryRepo;
    use crate::keys::KeyStore;
    use crate::token::RandomTokenGenerator;
    use crate::ROOT_KEY_NAME;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone)]
    struct TestClock(Arc<Mutex<SystemTime>>);

    impl TestClock {
        fn at(secs: u64) -> Self {
            Self(Arc::new(Mutex::new(
                SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            )))
        }
        fn advance(&self, d: Duration) {
            *self.0.lock().unwrap() += d;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> SystemTime {
            *self.0.lock().unwrap()
        }
    }

    type Svc = LinkService<Arc<InMemoryRepo>, Arc<InMemoryRepo>, RandomTokenGenerator, TestClock>;

    struct Fixture {
        svc: Svc,
        clock: TestClock,
        root: AuthContext,
        alice: AuthContext,
        bob: AuthContext,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepo::new());
        let clock = TestClock::at(1_700_000_000);
        let keys = KeyStore::new(repo.clone(), clock.clone());
        keys.bootstrap_root(Some("root")).unwrap();
        let a = keys.create("alice", false).unwrap();
        let b = keys.create("bob", false).unwrap();
        let svc = LinkService::new(repo.clone(), repo, RandomTokenGenerator, clock.clone())
            .with_site_host(Some("sho.rt".into()));
        Fixture {
            root: keys.authenticate("root").unwrap(),
            alice: keys.authenticate(&a.key).unwrap(),
            bob: keys.authenticate(&b.key).unwrap(),
            svc,
            clock,
        }
    }

    fn req(redirect: &str, custom: Option<&str>) -> ShortenRequest {
        ShortenRequest {
            custom: custom.map(str::to_string),
            redirect_to: redirect.into(),
            expires_at: None,
        }
    }

    #[test]
    fn shorten_retrieve_and_redirect_scenario() {
        let f = fixture();
        let t = f.svc.shorten(&f.alice, req("example.com/page", None)).unwrap();
        assert!((3..=6).contains(&t.as_str().len()));
        assert!(t.as_str().chars().all(|c| c.is_ascii_alphanumeric()));

        let detail = f.svc.retrieve(t.as_str()).unwrap();
        assert_eq!(detail.link.redirect_to, "https://example.com/page");
        assert_eq!(detail.link.visits, 0);
        assert_eq!(detail.owner.as_ref().map(|o| o.name.as_str()), Some("alice"));

        let target = f
            .svc
            .resolve_redirect(
                t.as_str(),
                Visitor {
                    user_agent: Some("curl/8".into()),
                    ip_address: Some("203.0.113.9".into()),
                    referrer: None,
                },
            )
            .unwrap();
        assert_eq!(target, "https://example.com/page");

        let detail = f.svc.retrieve(t.as_str()).unwrap();
        assert_eq!(detail.link.visits, 1);
        assert!(detail.link.last_visited_at.is_some());

        let visits = f.svc.visits(&f.alice, t.as_str()).unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].user_agent.as_deref(), Some("curl/8"));
    }

    #[test]
    fn shorten_requires_active_caller() {
        let f = fixture();
        let mut ghost = f.alice.clone();
        ghost.key = "not-a-key".into();
        assert!(matches!(
            f.svc.shorten(&ghost, req("https://example.com", None)),
            Err(CoreError::Unauthorized)
        ));
    }

    #[test]
    fn shorten_rejects_bad_targets() {
        let f = fixture();
        assert!(matches!(
            f.svc.shorten(&f.alice, req("", None)),
            Err(CoreError::InvalidUrl(_))
        ));
        assert!(matches!(
            f.svc.shorten(&f.alice, req("ftp://example.com", None)),
            Err(CoreError::DisallowedScheme(_))
        ));
        assert!(matches!(
            f.svc.shorten(&f.alice, req("https://sho.rt/x", None)),
            Err(CoreError::SelfReferential)
        ));
    }

    #[test]
    fn custom_tokens_must_be_alphanumeric_and_unique() {
        let f = fixture();
        let err = f
            .svc
            .shorten(&f.alice, req("https://example.com", Some("no-dash")))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidToken(_)));
        assert!(f.svc.retrieve("no-dash").is_err());

        let t = f
            .svc
            .shorten(&f.alice, req("https://one.example", Some("mine")))
            .unwrap();
        assert_eq!(t.as_str(), "mine");
        assert!(matches!(
            f.svc.shorten(&f.bob, req("https://two.example", Some("mine"))),
            Err(CoreError::TokenTaken)
        ));
        assert_eq!(f.svc.retrieve("mine").unwrap().link.redirect_to, "https://one.example/");
        assert!(matches!(
            f.svc.shorten(&f.bob, req("https://two.example", Some("api"))),
            Err(CoreError::TokenTaken)
        ));
    }

    #[test]
    fn inactive_and_expired_links_do_not_resolve() {
        let f = fixture();
        f.svc.shorten(&f.alice, req("https://example.com", Some("off"))).unwrap();
        f.svc
            .update(
                &f.alice,
                "off",
                LinkUpdate { is_active: Field::Present(false), ..Default::default() },
            )
            .unwrap();
        assert!(matches!(
            f.svc.resolve_redirect("off", Visitor::default()),
            Err(CoreError::NotFound)
        ));
        assert!(f.svc.retrieve("off").is_ok());

        let mut soon = req("https://example.com", Some("soon"));
        soon.expires_at = Some(f.clock.now() + Duration::from_secs(60));
        f.svc.shorten(&f.alice, soon).unwrap();
        assert!(f.svc.resolve_redirect("soon", Visitor::default()).is_ok());
        f.clock.advance(Duration::from_secs(61));
        assert!(matches!(
            f.svc.resolve_redirect("soon", Visitor::default()),
            Err(CoreError::NotFound)
        ));
        assert!(matches!(
            f.svc.resolve_redirect("missing", Visitor::default()),
            Err(CoreError::NotFound)
        ));
    }

    #[test]
    fn ownership_gates_delete_and_update() {
        let f = fixture();
        f.svc.shorten(&f.alice, req("https://example.com", Some("hers"))).unwrap();

        assert!(matches!(f.svc.delete(&f.bob, "hers"), Err(CoreError::Unauthorized)));
        assert!(matches!(
            f.svc.update(
                &f.bob,
                "hers",
                LinkUpdate { is_active: Field::Present(false), ..Default::default() }
            ),
            Err(CoreError::Unauthorized)
        ));
        f.svc
            .update(
                &f.root,
                "hers",
                LinkUpdate { redirect_to: Field::Present("https://new.example".into()), ..Default::default() },
            )
            .unwrap();
        f.svc.delete(&f.alice, "hers").unwrap();
        assert!(matches!(f.svc.retrieve("hers"), Err(CoreError::NotFound)));
        assert!(matches!(f.svc.delete(&f.alice, "hers"), Err(CoreError::NotFound)));
    }

    #[test]
    fn update_renames_and_reports_conflicts() {
        let f = fixture();
        f.svc.shorten(&f.alice, req("https://a.example", Some("first"))).unwrap();
        f.svc.shorten(&f.alice, req("https://b.example", Some("second"))).unwrap();

        let rename = |t: &str| LinkUpdate { shortened: Field::Present(t.into()), ..Default::default() };
        assert!(matches!(
            f.svc.update(&f.alice, "first", rename("second")),
            Err(CoreError::Conflict)
        ));
        assert!(matches!(
            f.svc.update(&f.alice, "first", rename("bad token")),
            Err(CoreError::InvalidToken(_))
        ));
        // Same token is a no-op, not a conflict with itself.
        assert!(f.svc.update(&f.alice, "first", rename("first")).is_ok());

        let renamed = f.svc.update(&f.alice, "first", rename("third")).unwrap();
        assert_eq!(renamed.shortened.as_str(), "third");
        assert!(f.svc.retrieve("first").is_err());
        assert!(f.svc.retrieve("third").is_ok());
    }

    #[test]
    fn epoch_expiry_clears_and_other_values_replace() {
        let f = fixture();
        let mut r = req("https://example.com", Some("exp"));
        r.expires_at = Some(f.clock.now() + Duration::from_secs(3600));
        f.svc.shorten(&f.alice, r).unwrap();

        let later = f.clock.now() + Duration::from_secs(7200);
        let link = f
            .svc
            .update(&f.alice, "exp", LinkUpdate { expires_at: Field::Present(later), ..Default::default() })
            .unwrap();
        assert_eq!(link.expires_at, Some(later));

        let link = f
            .svc
            .update(
                &f.alice,
                "exp",
                LinkUpdate { expires_at: Field::Present(SystemTime::UNIX_EPOCH), ..Default::default() },
            )
            .unwrap();
        assert_eq!(link.expires_at, None);
        assert_eq!(f.svc.retrieve("exp").unwrap().link.expires_at, None);
    }

    #[test]
    fn listing_rules() {
        let f = fixture();
        f.svc.shorten(&f.alice, req("https://a.example", None)).unwrap();
        f.svc.shorten(&f.alice, req("https://b.example", None)).unwrap();
        f.svc.shorten(&f.bob, req("https://c.example", None)).unwrap();

        assert!(matches!(f.svc.retrieve_all(&f.alice), Err(CoreError::Forbidden)));
        let all = f.svc.retrieve_all(&f.root).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|d| d.owner.is_some()));

        assert_eq!(f.svc.retrieve_all_by_key(&f.alice, &f.alice.key).unwrap().len(), 2);
        assert!(matches!(
            f.svc.retrieve_all_by_key(&f.alice, &f.bob.key),
            Err(CoreError::Unauthorized)
        ));
        let bobs = f.svc.retrieve_all_by_key(&f.root, &f.bob.key).unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].owner.as_ref().map(|o| o.name.as_str()), Some("bob"));
        assert!(matches!(
            f.svc.retrieve_all_by_key(&f.root, "nobody"),
            Err(CoreError::NotFound)
        ));
        assert_eq!(f.root.name, ROOT_KEY_NAME);
    }

    /// Link store that runs one sweep right after the next `get`, so the
    /// row changes between the service's read and its write.
    struct SweepAfterRead {
        inner: Arc<InMemoryRepo>,
        armed: Mutex<bool>,
    }

    impl LinkRepository for SweepAfterRead {
        fn get(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
            let found = self.inner.get(shortened)?;
            let mut armed = self.armed.lock().unwrap();
            if *armed {
                *armed = false;
                let far_future = SystemTime::UNIX_EPOCH + Duration::from_secs(4_000_000_000);
                self.inner
                    .sweep_expired(far_future, SystemTime::UNIX_EPOCH, &crate::expiry::tombstone_prefix())?;
            }
            Ok(found)
        }
        fn get_active(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
            self.inner.get_active(shortened)
        }
        fn insert(&self, link: Link) -> Result<(), CoreError> {
            self.inner.insert(link)
        }
        fn update(&self, current: &ShortToken, link: &Link) -> Result<(), CoreError> {
            self.inner.update(current, link)
        }
        fn delete(&self, id: crate::LinkId) -> Result<(), CoreError> {
            self.inner.delete(id)
        }
        fn list_all(&self) -> Result<Vec<Link>, CoreError> {
            self.inner.list_all()
        }
        fn list_by_owner(&self, owner: KeyId) -> Result<Vec<Link>, CoreError> {
            self.inner.list_by_owner(owner)
        }
        fn record_visit(&self, visit: LinkVisit) -> Result<(), CoreError> {
            self.inner.record_visit(visit)
        }
        fn list_visits(&self, link_id: crate::LinkId) -> Result<Vec<LinkVisit>, CoreError> {
            self.inner.list_visits(link_id)
        }
        fn sweep_expired(
            &self,
            now: SystemTime,
            stale_before: SystemTime,
            prefix: &str,
        ) -> Result<usize, CoreError> {
            self.inner.sweep_expired(now, stale_before, prefix)
        }
    }

    #[test]
    fn update_after_concurrent_sweep_keeps_link_retired() {
        let repo = Arc::new(InMemoryRepo::new());
        let clock = TestClock::at(1_700_000_000);
        let keys = KeyStore::new(repo.clone(), clock.clone());
        let created = keys.create("alice", false).unwrap();
        let alice = keys.authenticate(&created.key).unwrap();
        let links = Arc::new(SweepAfterRead {
            inner: repo.clone(),
            armed: Mutex::new(false),
        });
        let svc = LinkService::new(repo.clone(), links.clone(), RandomTokenGenerator, clock.clone());

        let mut request = req("https://example.com", Some("old"));
        request.expires_at = Some(clock.now() + Duration::from_secs(60));
        svc.shorten(&alice, request).unwrap();

        *links.armed.lock().unwrap() = true;
        let err = svc
            .update(
                &alice,
                "old",
                LinkUpdate {
                    redirect_to: Field::Present("https://new.example".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound));

        let stored = repo.list_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].is_active);
        assert!(crate::expiry::is_tombstone(stored[0].shortened.as_str()));
        assert_eq!(stored[0].redirect_to, "https://example.com/");
        assert!(repo.get(&ShortToken::new("old").unwrap()).unwrap().is_none());
    }
}
