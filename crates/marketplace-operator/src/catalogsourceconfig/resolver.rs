//! Resolution of requested packages to the operator sources serving them

use crate::datastore::{Datastore, OperatorSourceKey};

const UNRESOLVED_PREFIX: &str = "Unable to resolve the source";

/// Sources serving the requested packages
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub sources: Vec<OperatorSourceKey>,
    pub packages: Vec<String>,
}

impl Resolution {
    /// UIDs of the resolved sources, in resolution order
    pub fn source_uids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.uid.clone()).collect()
    }
}

fn bracketed(packages: &[String]) -> String {
    format!("[{}]", packages.join(" "))
}

/// Resolve `packages` against the datastore
///
/// A named `source` must serve every package. Without one, a single source
/// covering everything is preferred; otherwise each package is taken from the
/// first source serving it. The error is the message shown on the object.
pub fn resolve(
    datastore: &Datastore,
    namespace: &str,
    source: &str,
    packages: &[String],
) -> Result<Resolution, String> {
    if packages.is_empty() {
        return Err(format!("{} - no packages were requested", UNRESOLVED_PREFIX));
    }

    if !source.is_empty() {
        let key = datastore.get_operator_source(namespace, source).ok_or_else(|| {
            format!("{} - the source {} does not exist", UNRESOLVED_PREFIX, source)
        })?;
        let served = datastore.get_package_ids_by_operator_source(&key.uid);
        let missing: Vec<String> = packages
            .iter()
            .filter(|p| !served.contains(p))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "{} - the source {} does not contain the requested package(s) {}",
                UNRESOLVED_PREFIX,
                source,
                bracketed(&missing)
            ));
        }
        return Ok(Resolution {
            sources: vec![key],
            packages: packages.to_vec(),
        });
    }

    if let Some(key) = datastore.sources_serving(packages).into_iter().next() {
        return Ok(Resolution {
            sources: vec![key],
            packages: packages.to_vec(),
        });
    }

    let catalog: Vec<(OperatorSourceKey, Vec<String>)> = datastore
        .get_all_operator_sources()
        .into_iter()
        .map(|key| {
            let ids = datastore.get_package_ids_by_operator_source(&key.uid);
            (key, ids)
        })
        .collect();

    let mut sources: Vec<OperatorSourceKey> = Vec::new();
    let mut unresolved = Vec::new();
    for package in packages {
        match catalog.iter().find(|(_, ids)| ids.contains(package)) {
            Some((key, _)) => {
                if !sources.iter().any(|s| s.uid == key.uid) {
                    sources.push(key.clone());
                }
            }
            None => unresolved.push(package.clone()),
        }
    }

    if !unresolved.is_empty() {
        return Err(format!(
            "{} - no source contains the requested package(s) {}",
            UNRESOLVED_PREFIX,
            bracketed(&unresolved)
        ));
    }
    Ok(Resolution {
        sources,
        packages: packages.to_vec(),
    })
}
