use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::{
    ApiKey, CoreError, KeyId, KeyRepository, Link, LinkId, LinkRepository, LinkVisit, ShortToken,
};

#[derive(Default)]
struct State {
    keys: BTreeMap<KeyId, ApiKey>,
    links: BTreeMap<LinkId, Link>,
    visits: Vec<LinkVisit>,
}

impl State {
    fn token_in_use(&self, token: &ShortToken, except: Option<LinkId>) -> bool {
        self.links
            .values()
            .any(|l| &l.shortened == token && Some(l.id) != except)
    }

    fn key_clash(&self, key: &ApiKey) -> bool {
        self.keys
            .values()
            .any(|k| k.id != key.id && (k.key == key.key || k.name == key.name))
    }
}

/// In-memory store implementing both repository ports. One mutex guards all
/// state, so multi-row operations are atomic.
pub struct InMemoryRepo {
    inner: Mutex<State>,
}

impl InMemoryRepo {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, CoreError> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

impl Default for InMemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRepository for InMemoryRepo {
    fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>, CoreError> {
        Ok(self.state()?.keys.values().find(|k| k.key == key).cloned())
    }

    fn find_by_name(&self, name: &str) -> Result<Option<ApiKey>, CoreError> {
        Ok(self.state()?.keys.values().find(|k| k.name == name).cloned())
    }

    fn find_by_id(&self, id: KeyId) -> Result<Option<ApiKey>, CoreError> {
        Ok(self.state()?.keys.get(&id).cloned())
    }

    fn list_keys(&self) -> Result<Vec<ApiKey>, CoreError> {
        let mut keys: Vec<ApiKey> = self.state()?.keys.values().cloned().collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    fn insert_key(&self, key: ApiKey) -> Result<(), CoreError> {
        let mut st = self.state()?;
        if st.keys.contains_key(&key.id) || st.key_clash(&key) {
            return Err(CoreError::AlreadyExists);
        }
        st.keys.insert(key.id, key);
        Ok(())
    }

    fn update_key(&self, key: &ApiKey) -> Result<(), CoreError> {
        let mut st = self.state()?;
        if !st.keys.contains_key(&key.id) {
            return Err(CoreError::NotFound);
        }
        if st.key_clash(key) {
            return Err(CoreError::AlreadyExists);
        }
        st.keys.insert(key.id, key.clone());
        Ok(())
    }

    fn delete_key(&self, id: KeyId) -> Result<(), CoreError> {
        match self.state()?.keys.remove(&id) {
            Some(_) => Ok(()),
            None => Err(CoreError::NotFound),
        }
    }

    fn touch_key(&self, id: KeyId, at: SystemTime) -> Result<(), CoreError> {
        match self.state()?.keys.get_mut(&id) {
            Some(k) => {
                k.last_used_at = Some(at);
                Ok(())
            }
            None => Err(CoreError::NotFound),
        }
    }
}

impl LinkRepository for InMemoryRepo {
    fn get(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
        Ok(self
            .state()?
            .links
            .values()
            .find(|l| &l.shortened == shortened)
            .cloned())
    }

    fn get_active(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
        Ok(self
            .state()?
            .links
            .values()
            .find(|l| l.is_active && &l.shortened == shortened)
            .cloned())
    }

    fn insert(&self, link: Link) -> Result<(), CoreError> {
        let mut st = self.state()?;
        if st.links.contains_key(&link.id) || st.token_in_use(&link.shortened, None) {
            return Err(CoreError::AlreadyExists);
        }
        st.links.insert(link.id, link);
        Ok(())
    }

    fn update(&self, current: &ShortToken, link: &Link) -> Result<(), CoreError> {
        let mut st = self.state()?;
        match st.links.get(&link.id) {
            Some(stored) if &stored.shortened == current => {}
            _ => return Err(CoreError::NotFound),
        }
        if st.token_in_use(&link.shortened, Some(link.id)) {
            return Err(CoreError::AlreadyExists);
        }
        st.links.insert(link.id, link.clone());
        Ok(())
    }

    fn delete(&self, id: LinkId) -> Result<(), CoreError> {
        match self.state()?.links.remove(&id) {
            Some(_) => Ok(()),
            None => Err(CoreError::NotFound),
        }
    }

    fn list_all(&self) -> Result<Vec<Link>, CoreError> {
        let mut links: Vec<Link> = self.state()?.links.values().cloned().collect();
        links.sort_by_key(|l| l.created_at);
        Ok(links)
    }

    fn list_by_owner(&self, owner: KeyId) -> Result<Vec<Link>, CoreError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|l| l.created_by == owner)
            .collect())
    }

    fn record_visit(&self, visit: LinkVisit) -> Result<(), CoreError> {
        let mut st = self.state()?;
        let link = st.links.get_mut(&visit.link_id).ok_or(CoreError::NotFound)?;
        link.visits += 1;
        link.last_visited_at = Some(visit.visited_at);
        st.visits.push(visit);
        Ok(())
    }

    fn list_visits(&self, link_id: LinkId) -> Result<Vec<LinkVisit>, CoreError> {
        Ok(self
            .state()?
            .visits
            .iter()
            .filter(|v| v.link_id == link_id)
            .cloned()
            .collect())
    }

    fn sweep_expired(
        &self,
        now: SystemTime,
        stale_before: SystemTime,
        prefix: &str,
    ) -> Result<usize, CoreError> {
        let mut st = self.state()?;
        let mut swept = 0;
        for link in st.links.values_mut() {
            if !link.is_sweepable(now, stale_before) {
                continue;
            }
            link.shortened = ShortToken::new(format!("{prefix}{}", link.id))?;
            link.is_active = false;
            link.updated_at = now;
            swept += 1;
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn key(name: &str, secret: &str) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            key: secret.into(),
            name: name.into(),
            is_admin: false,
            is_active: true,
            created_at: SystemTime::UNIX_EPOCH,
            updated_at: SystemTime::UNIX_EPOCH,
            last_used_at: None,
        }
    }

    fn link(token: &str) -> Link {
        Link::new(
            ShortToken::new(token).unwrap(),
            "https://example.com/".into(),
            None,
            Uuid::new_v4(),
            SystemTime::UNIX_EPOCH,
        )
    }

    #[test]
    fn key_uniqueness_on_secret_and_name() {
        let repo = InMemoryRepo::new();
        repo.insert_key(key("a", "s1")).unwrap();
        assert!(matches!(repo.insert_key(key("a", "s2")), Err(CoreError::AlreadyExists)));
        assert!(matches!(repo.insert_key(key("b", "s1")), Err(CoreError::AlreadyExists)));

        let mut b = key("b", "s2");
        repo.insert_key(b.clone()).unwrap();
        b.name = "a".into();
        assert!(matches!(repo.update_key(&b), Err(CoreError::AlreadyExists)));
    }

    #[test]
    fn token_uniqueness_and_active_lookup() {
        let repo = InMemoryRepo::new();
        let mut l = link("abc");
        repo.insert(l.clone()).unwrap();
        assert!(matches!(repo.insert(link("abc")), Err(CoreError::AlreadyExists)));

        l.is_active = false;
        repo.update(&l.shortened, &l).unwrap();
        assert!(repo.get(&l.shortened).unwrap().is_some());
        assert!(repo.get_active(&l.shortened).unwrap().is_none());
    }

    #[test]
    fn record_visit_bumps_counter() {
        let repo = InMemoryRepo::new();
        let l = link("v");
        repo.insert(l.clone()).unwrap();
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        for _ in 0..3 {
            repo.record_visit(LinkVisit {
                id: Uuid::new_v4(),
                link_id: l.id,
                visited_at: at,
                user_agent: None,
                ip_address: None,
                referrer: None,
            })
            .unwrap();
        }
        let stored = repo.get(&l.shortened).unwrap().unwrap();
        assert_eq!(stored.visits, 3);
        assert_eq!(stored.last_visited_at, Some(at));
        assert_eq!(repo.list_visits(l.id).unwrap().len(), 3);
    }

    #[test]
    fn delete_leaves_visits_behind() {
        let repo = InMemoryRepo::new();
        let l = link("d");
        repo.insert(l.clone()).unwrap();
        repo.record_visit(LinkVisit {
            id: Uuid::new_v4(),
            link_id: l.id,
            visited_at: SystemTime::UNIX_EPOCH,
            user_agent: None,
            ip_address: None,
            referrer: None,
        })
        .unwrap();
        repo.delete(l.id).unwrap();
        assert!(repo.get(&l.shortened).unwrap().is_none());
        assert_eq!(repo.list_visits(l.id).unwrap().len(), 1);
        assert!(matches!(repo.delete(l.id), Err(CoreError::NotFound)));
    }
}
