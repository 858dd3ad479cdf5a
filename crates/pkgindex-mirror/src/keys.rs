//! Keyfs keys used by a mirror stage

use pkgindex_keyfs::PatternKey;

/// Set of project names cached on the stage
pub const PROJNAMES: PatternKey = PatternKey::new("PROJNAMES", "{user}/{index}/.projects");

/// Simple links record of one project
pub const PROJSIMPLELINKS: PatternKey =
    PatternKey::new("PROJSIMPLELINKS", "{user}/{index}/+simple/{project}");

/// Set once the primary loaded the upstream name list for the first time
pub const MIRRORNAMESINIT: PatternKey =
    PatternKey::new("MIRRORNAMESINIT", "{user}/{index}/.mirrornameschange");

/// Release file with a known hash
pub const STAGEFILE: PatternKey = PatternKey::new(
    "STAGEFILE",
    "{user}/{index}/+f/{hashdir_a}/{hashdir_b}/{filename}",
);

/// Release file without hash, addressed by its URL directory
pub const STAGEEXTFILE: PatternKey =
    PatternKey::new("STAGEFILE", "{user}/{index}/+e/{dirname}/{filename}");
