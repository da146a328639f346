pub(crate) mod scope_guard;

pub(crate) use scope_guard::ScopeGuard;
