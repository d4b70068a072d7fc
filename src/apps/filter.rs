//! Per-user visibility

use super::{AppEntry, Category};

/// Whether `app` is visible to a user with `groups`.
///
/// Admins see everything. Hidden entries and an empty allow-list are admin
/// only. Otherwise the user needs at least one group in the allow-list
/// (trimmed, case-sensitive).
#[must_use]
pub fn is_visible(app: &AppEntry, groups: &[String], is_admin: bool) -> bool {
    if is_admin {
        return true;
    }
    if app.hidden {
        return false;
    }
    app.groups.iter().map(|g| g.trim()).any(|allowed| {
        !allowed.is_empty() && groups.iter().any(|g| g.trim() == allowed)
    })
}

/// Categories restricted to what the user may see. Order is preserved and
/// categories left empty are dropped.
#[must_use]
pub fn filter_for_user(categories: &[Category], groups: &[String], is_admin: bool) -> Vec<Category> {
    categories
        .iter()
        .filter_map(|category| {
            let apps: Vec<AppEntry> = category
                .apps
                .iter()
                .filter(|app| is_visible(app, groups, is_admin))
                .cloned()
                .collect();
            (!apps.is_empty()).then(|| Category {
                name: category.name.clone(),
                apps,
            })
        })
        .collect()
}
