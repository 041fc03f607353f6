//! Startup provisioning from configuration.
//!
//! A fresh database has no accounts and no spaces. `apply` creates the
//! configured admin account and registers every configured space that is
//! not known yet, then hands interrupted trash operations back to the trash.

use crate::{
    models::{permission::Role, space::NewSpace},
    services::{
        engine::SpaceEngine,
        error::{EngineError, EngineResult},
    },
};
use std::{fmt, str::FromStr};
use tracing::{info, warn};

/// What to provision at startup.
#[derive(Clone, Debug, Default)]
pub struct Seed {
    pub admin: Option<AdminSeed>,
    pub spaces: Vec<SpaceSeed>,
}

#[derive(Clone)]
pub struct AdminSeed {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AdminSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminSeed")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A space given as `name=path`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceSeed {
    pub name: String,
    pub root_path: String,
}

impl FromStr for SpaceSeed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, path)) if !name.trim().is_empty() && !path.trim().is_empty() => {
                Ok(SpaceSeed {
                    name: name.trim().to_string(),
                    root_path: path.trim().to_string(),
                })
            }
            _ => Err(format!("expected `name=path`, got `{}`", s)),
        }
    }
}

/// Parse a comma separated `name=path` list. Blank entries are ignored.
pub fn parse_spaces(value: &str) -> Result<Vec<SpaceSeed>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(SpaceSeed::from_str)
        .collect()
}

pub async fn apply(engine: &SpaceEngine, seed: &Seed) -> EngineResult<()> {
    if let Some(admin) = &seed.admin {
        engine
            .accounts()
            .create_user(&admin.username, &admin.password, Role::Admin)
            .await?;
        info!(user = %admin.username, "admin account ready");
    }

    for wanted in &seed.spaces {
        match engine.registry().get_by_name(&wanted.name).await {
            Ok(space) if space.root_path != wanted.root_path => {
                warn!(
                    name = %space.name,
                    configured = %wanted.root_path,
                    registered = %space.root_path,
                    "space already registered with another root; keeping the registered one"
                );
            }
            Ok(_) => {}
            Err(EngineError::NotFound(_)) => {
                let space = engine
                    .registry()
                    .create(NewSpace {
                        name: wanted.name.clone(),
                        root_path: wanted.root_path.clone(),
                        created_by: seed.admin.as_ref().map(|a| a.username.clone()),
                        ..Default::default()
                    })
                    .await?;
                info!(space_id = space.id, name = %space.name, "registered space");
            }
            Err(err) => return Err(err),
        }
    }

    engine.release_stale_trash_claims().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory_pool,
        models::permission::Permission,
        services::engine::EngineOptions,
    };
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn space_lists_parse_and_reject_garbage() {
        let spaces = parse_spaces(" docs=/srv/docs, ,media = /srv/media ").unwrap();
        assert_eq!(
            spaces,
            vec![
                SpaceSeed {
                    name: "docs".into(),
                    root_path: "/srv/docs".into()
                },
                SpaceSeed {
                    name: "media".into(),
                    root_path: "/srv/media".into()
                },
            ]
        );
        assert!(parse_spaces("docs").is_err());
        assert!(parse_spaces("=/srv").is_err());
        assert!(parse_spaces("").unwrap().is_empty());
    }

    #[test]
    fn admin_password_is_not_logged() {
        let admin = AdminSeed {
            username: "root".into(),
            password: "hunter2".into(),
        };
        let shown = format!("{:?}", admin);
        assert!(shown.contains("root"));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn fresh_database_becomes_usable() {
        let dir = tempdir().unwrap();
        let engine = SpaceEngine::new(Arc::new(memory_pool().await), EngineOptions::default());
        let docs_root = dir.path().join("docs").to_string_lossy().into_owned();
        let seed = Seed {
            admin: Some(AdminSeed {
                username: "root".into(),
                password: "rootpw".into(),
            }),
            spaces: vec![SpaceSeed {
                name: "docs".into(),
                root_path: docs_root.clone(),
            }],
        };

        apply(&engine, &seed).await.unwrap();
        // Running again on the same database changes nothing.
        apply(&engine, &seed).await.unwrap();

        let admin = engine
            .accounts()
            .authenticate("root", "rootpw")
            .await
            .unwrap()
            .unwrap();
        assert!(admin.is_admin());
        let spaces = engine.spaces_for(&admin, Permission::Manage).await.unwrap();
        assert_eq!(spaces.len(), 1);
        assert_eq!(spaces[0].root_path, docs_root);
        assert_eq!(spaces[0].created_by.as_deref(), Some("root"));
        assert!(dir.path().join("docs").is_dir());
    }
}
