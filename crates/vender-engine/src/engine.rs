//! Action registry and scenario executor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::doer::{Arg, Doer, ExecEnv};
use crate::error::{EngineError, Result};

/// Called with the doer name and its run time.
pub type ProfileFn = Arc<dyn Fn(&str, Duration) + Send + Sync>;

struct Profile {
    re: Regex,
    min: Duration,
    f: ProfileFn,
}

pub struct Engine {
    actions: RwLock<HashMap<String, Doer>>,
    profile_on: AtomicBool,
    profile: RwLock<Option<Profile>>,
}

/// `name(N)` or `name(?)` split into `("name(?)", "N" | "?")`.
fn split_arg(action: &str) -> Option<(String, &str)> {
    let inner = action.strip_suffix(')')?;
    let open = inner.rfind('(')?;
    let (head, arg) = (&inner[..open], &inner[open + 1..]);
    let valid = arg == "?" || (!arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()));
    if head.is_empty() || !valid {
        return None;
    }
    Some((format!("{head}(?)"), arg))
}

/// `sleep(250ms)` or `sleep(2s)`.
fn parse_sleep(action: &str) -> Option<Duration> {
    let inner = action.strip_prefix("sleep(")?.strip_suffix(')')?;
    if let Some(ms) = inner.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    inner
        .strip_suffix('s')?
        .parse()
        .ok()
        .map(Duration::from_secs)
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Registry with the built-ins `ignore(?)` and `sleep(100ms)`.
    pub fn new() -> Self {
        let mut actions = HashMap::with_capacity(128);
        actions.insert(
            "ignore(?)".to_string(),
            Doer::IgnoreArg(Box::new(Doer::nothing("ignore"))),
        );
        actions.insert(
            "sleep(100ms)".to_string(),
            Doer::Sleep(Duration::from_millis(100)),
        );
        Self {
            actions: RwLock::new(actions),
            profile_on: AtomicBool::new(false),
            profile: RwLock::new(None),
        }
    }

    /// # Errors
    ///
    /// [`EngineError::AlreadyRegistered`] when `name` is taken.
    pub fn register(&self, name: impl Into<String>, d: Doer) -> Result<()> {
        let name = name.into();
        let mut actions = self.actions.write().unwrap_or_else(PoisonError::into_inner);
        if actions.contains_key(&name) {
            return Err(EngineError::AlreadyRegistered { name });
        }
        debug!(action = %name, "engine register");
        actions.insert(name, d);
        Ok(())
    }

    /// Parse `scenario` and register it under `name`.
    pub fn register_alias(&self, name: &str, scenario: &str) -> Result<()> {
        let d = self
            .parse_text(name, scenario)
            .map_err(|e| e.annotate(format!("alias={name}")))?;
        self.register(name, d)
    }

    pub fn get(&self, name: &str) -> Option<Doer> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Exact name, else `name(N)` through the registered `name(?)` with
    /// `N` applied.
    pub fn resolve(&self, action: &str) -> Result<Doer> {
        let (template, arg) = {
            let actions = self.actions.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(d) = actions.get(action) {
                return Ok(d.clone());
            }
            let Some((norm, arg)) = split_arg(action) else {
                return Err(EngineError::not_resolved(action));
            };
            match actions.get(&norm) {
                Some(d) => (d.clone(), arg),
                None => {
                    debug!(action, normalized = %norm, "resolve not found");
                    return Err(EngineError::not_resolved(norm).annotate(action));
                }
            }
        };
        if arg == "?" {
            return Ok(template);
        }
        let n: Arg = arg
            .parse()
            .map_err(|e: std::num::ParseIntError| EngineError::parse(action, e.to_string()))?;
        match template.apply(self, n) {
            Ok(Some(d)) => Ok(d),
            Ok(None) => Err(EngineError::ArgNotApplied {
                action: action.to_string(),
            }),
            Err(e) => {
                debug!(action, error = %e, "resolve apply");
                Err(e.annotate(action))
            }
        }
    }

    /// Like [`Engine::resolve`] but defers unknown names to execution time.
    pub fn resolve_or_lazy(&self, action: &str) -> Doer {
        if let Some(d) = self.get(action) {
            return d;
        }
        if let Some(d) = parse_sleep(action) {
            return Doer::Sleep(d);
        }
        Doer::Lazy(action.to_string())
    }

    /// Whitespace separated actions become a sequence named `tag`;
    /// `{ a b }` groups run in parallel.
    ///
    /// # Errors
    ///
    /// [`EngineError::Parse`] for nested or unbalanced braces.
    pub fn parse_text(&self, tag: &str, text: &str) -> Result<Doer> {
        let mut seq: Vec<Doer> = Vec::new();
        let mut group: Option<Vec<Doer>> = None;
        let mut words = 0;
        for word in text.split_whitespace() {
            words += 1;
            let opened = word.len() - word.trim_start_matches('{').len();
            let body = word.trim_start_matches('{');
            let closed = body.len() - body.trim_end_matches('}').len();
            let body = body.trim_end_matches('}');
            if opened > 1 || closed > 1 || body.contains(['{', '}']) {
                return Err(EngineError::parse(tag, format!("nested braces at {word}")));
            }
            if opened == 1 {
                if group.is_some() {
                    return Err(EngineError::parse(tag, format!("nested braces at {word}")));
                }
                group = Some(Vec::new());
            }
            if !body.is_empty() {
                let d = self.resolve_or_lazy(body);
                match group.as_mut() {
                    Some(g) => g.push(d),
                    None => seq.push(d),
                }
            }
            if closed == 1 {
                let Some(items) = group.take() else {
                    return Err(EngineError::parse(tag, format!("unbalanced '}}' at {word}")));
                };
                let names: Vec<String> = items.iter().map(ToString::to_string).collect();
                seq.push(Doer::parallel(format!("{{{}}}", names.join(" ")), items));
            }
        }
        if group.is_some() {
            return Err(EngineError::parse(tag, "unbalanced '{'"));
        }
        if words == 0 {
            return Ok(Doer::nothing(tag));
        }
        Ok(Doer::seq(tag, seq))
    }

    /// Validate, then run with profiling.
    pub async fn exec(&self, env: &ExecEnv, d: &Doer) -> Result<()> {
        d.validate(self)?;
        self.exec_part(env, d).await
    }

    /// Run with profiling, no validation. Composites use this for children.
    pub async fn exec_part(&self, env: &ExecEnv, d: &Doer) -> Result<()> {
        let profile = self.match_profile(d);
        let start = Instant::now();
        let result = d.run(self, env).await;
        if let Some((name, min, f)) = profile {
            let elapsed = start.elapsed();
            if elapsed >= min {
                f(&name, elapsed);
            }
        }
        result
    }

    /// Like [`Engine::exec`], logging a validation failure.
    pub async fn validate_exec(&self, env: &ExecEnv, d: &Doer) -> Result<()> {
        if let Err(e) = d.validate(self) {
            warn!(doer = %d, error = %e, "validate");
            return Err(e);
        }
        self.exec_part(env, d).await
    }

    /// Parse and execute each scenario as `tag:i`. Every item runs; the
    /// first error is returned and the rest are logged.
    pub async fn exec_list(&self, env: &ExecEnv, tag: &str, list: &[String]) -> Result<()> {
        let mut errs = Vec::new();
        for (i, text) in list.iter().enumerate() {
            let item_tag = format!("{tag}:{i}");
            let result = match self.parse_text(&item_tag, text) {
                Ok(d) => self.exec(env, &d).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                errs.push(e);
            }
        }
        let mut errs = errs.into_iter();
        let Some(first) = errs.next() else {
            return Ok(());
        };
        for e in errs {
            error!(tag, error = %e, "exec list");
        }
        Err(first)
    }

    /// Report doers whose name matches `re` and ran at least `min`.
    /// `None` for either argument turns profiling off.
    pub fn set_profile(&self, re: Option<Regex>, min: Duration, f: Option<ProfileFn>) {
        let mut slot = self.profile.write().unwrap_or_else(PoisonError::into_inner);
        *slot = match (re, f) {
            (Some(re), Some(f)) => Some(Profile { re, min, f }),
            _ => None,
        };
        self.profile_on.store(slot.is_some(), Ordering::Release);
    }

    fn match_profile(&self, d: &Doer) -> Option<(String, Duration, ProfileFn)> {
        if !self.profile_on.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.profile.read().unwrap_or_else(PoisonError::into_inner);
        let p = slot.as_ref()?;
        let name = d.to_string();
        p.re.is_match(&name).then(|| (name, p.min, p.f.clone()))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("actions", &self.list().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    fn inc(e: &Engine, name: &str) -> Arc<AtomicU32> {
        let n = Arc::new(AtomicU32::new(0));
        let c = n.clone();
        e.register(
            name,
            Doer::func(name, move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();
        n
    }

    #[rstest]
    #[case("drop(5)", Some(("drop(?)", "5")))]
    #[case("drop(?)", Some(("drop(?)", "?")))]
    #[case("a(b)(12)", Some(("a(b)(?)", "12")))]
    #[case("drop()", None)]
    #[case("(5)", None)]
    #[case("drop(-1)", None)]
    #[case("drop", None)]
    fn test_split_arg(#[case] input: &str, #[case] expect: Option<(&str, &str)>) {
        let got = split_arg(input);
        assert_eq!(
            got.as_ref().map(|(n, a)| (n.as_str(), *a)),
            expect
        );
    }

    #[rstest]
    #[case("sleep(100ms)", Some(Duration::from_millis(100)))]
    #[case("sleep(2s)", Some(Duration::from_secs(2)))]
    #[case("sleep(2m)", None)]
    #[case("sleep(ms)", None)]
    fn test_parse_sleep(#[case] input: &str, #[case] expect: Option<Duration>) {
        assert_eq!(parse_sleep(input), expect);
    }

    #[test]
    fn test_register_duplicate() {
        let e = Engine::new();
        e.register("a", Doer::nothing("a")).unwrap();
        assert!(matches!(
            e.register("a", Doer::nothing("a")),
            Err(EngineError::AlreadyRegistered { .. })
        ));
        assert!(e.list().contains(&"ignore(?)".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_applies_argument() {
        let e = Engine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        e.register(
            "water(?)",
            Doer::func_arg("water", move |_, arg| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(arg);
                    Ok(())
                }
            }),
        )
        .unwrap();
        let d = e.resolve("water(120)").unwrap();
        assert_eq!(d.to_string(), "water:120");
        e.exec(&ExecEnv::new(), &d).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![120]);

        let err = e.resolve("steam(3)").unwrap_err();
        assert!(err.is_not_resolved());
        assert_eq!(err.to_string(), "steam(3): action=steam(?) not resolved");
    }

    #[test]
    fn test_resolve_not_applied() {
        let e = Engine::new();
        e.register("cup(?)", Doer::nothing("cup")).unwrap();
        assert!(matches!(
            e.resolve("cup(1)"),
            Err(EngineError::ArgNotApplied { .. })
        ));
        assert!(e.resolve("ignore(115)").is_ok());
    }

    #[tokio::test]
    async fn test_parse_text_lazy_and_sleep() {
        let e = Engine::new();
        let d = e.parse_text("t", "later sleep(5ms)").unwrap();
        assert!(d.validate(&e).unwrap_err().is_not_resolved());
        let n = inc(&e, "later");
        e.exec(&ExecEnv::new(), &d).await.unwrap();
        assert_eq!(n.load(Ordering::SeqCst), 1);
        match d {
            Doer::Seq(seq) => assert!(matches!(seq.items()[1], Doer::Sleep(_))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_text_empty() {
        let e = Engine::new();
        let d = e.parse_text("on_boot", "  ").unwrap();
        assert!(matches!(d, Doer::Nothing(ref n) if n == "on_boot"));
    }

    #[tokio::test]
    async fn test_parse_text_parallel_group() {
        let e = Engine::new();
        let a = inc(&e, "a");
        let b = inc(&e, "b");
        let c = inc(&e, "c");
        let d = e.parse_text("t", "a {b c} a").unwrap();
        let Doer::Seq(seq) = &d else {
            panic!("expected seq");
        };
        assert_eq!(seq.items().len(), 3);
        assert!(matches!(seq.items()[1], Doer::Parallel(_)));
        assert_eq!(seq.items()[1].to_string(), "{b c}");
        e.exec(&ExecEnv::new(), &d).await.unwrap();
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(c.load(Ordering::SeqCst), 1);

        let spaced = e.parse_text("t", "{ b c }").unwrap();
        let Doer::Seq(seq) = &spaced else {
            panic!("expected seq");
        };
        assert_eq!(seq.items().len(), 1);
    }

    #[rstest]
    #[case("{a {b} c}")]
    #[case("{{a}}")]
    #[case("{a b")]
    #[case("a }")]
    #[case("a{b")]
    fn test_parse_text_brace_errors(#[case] text: &str) {
        let e = Engine::new();
        assert!(matches!(
            e.parse_text("t", text),
            Err(EngineError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_exec_list_runs_all_returns_first() {
        let e = Engine::new();
        let n = inc(&e, "ok");
        let list = vec![
            "ok".to_string(),
            "missing_one".to_string(),
            "ok".to_string(),
            "missing_two".to_string(),
        ];
        let err = e.exec_list(&ExecEnv::new(), "on_boot", &list).await.unwrap_err();
        assert!(err.to_string().contains("missing_one"));
        assert!(err.to_string().contains("seq=on_boot:1"));
        assert_eq!(n.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_register_alias() {
        let e = Engine::new();
        let n = inc(&e, "grind");
        e.register_alias("@coffee", "grind grind").unwrap();
        let d = e.resolve("@coffee").unwrap();
        e.exec(&ExecEnv::new(), &d).await.unwrap();
        assert_eq!(n.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_hook() {
        let e = Engine::new();
        e.register("slow", Doer::Sleep(Duration::from_millis(30)))
            .unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = hits.clone();
        e.set_profile(
            Some(Regex::new("^Sleep").unwrap()),
            Duration::from_millis(20),
            Some(Arc::new(move |name: &str, _: Duration| h.lock().unwrap().push(name.to_string()))),
        );
        let d = e.parse_text("t", "slow sleep(5ms)").unwrap();
        e.exec(&ExecEnv::new(), &d).await.unwrap();
        assert_eq!(*hits.lock().unwrap(), vec!["Sleep(30ms)".to_string()]);

        e.set_profile(None, Duration::ZERO, None);
        e.exec(&ExecEnv::new(), &d).await.unwrap();
        assert_eq!(hits.lock().unwrap().len(), 1);
    }
}
