use std::{collections::HashMap, sync::Arc};

use log::debug;

use super::{EuclideanDistance, JaccardDistance, NumericDistance, SimilarityFunction};
use crate::{error::RegistrationError, peer::Profile};

/// Builds a similarity function for the given reference profile
pub type SimilarityConstructor = fn(Profile) -> Arc<dyn SimilarityFunction>;

/// A closed registry of similarity implementations, and the inventory of named
/// instances that protocols look up at selection time.
///
/// Implementations are registered under an implementation id (the built-ins are
/// `numeric`, `euclidean` and `jaccard`). Instances are then created under a
/// logical name with [SimFuncFactory::instantiate_funcs], and shared read-only by every
/// protocol configured with that name.
#[derive(Clone)]
pub struct SimFuncFactory {
    implementations: HashMap<String, SimilarityConstructor>,
    inventory: HashMap<String, Arc<dyn SimilarityFunction>>,
}

impl Default for SimFuncFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFuncFactory {
    /// A factory knowing the built-in implementations
    pub fn new() -> Self {
        let mut implementations: HashMap<String, SimilarityConstructor> = HashMap::new();
        implementations.insert("numeric".to_string(), |p| Arc::new(NumericDistance::new(p)));
        implementations.insert("euclidean".to_string(), |p| {
            Arc::new(EuclideanDistance::new(p))
        });
        implementations.insert("jaccard".to_string(), |p| Arc::new(JaccardDistance::new(p)));
        Self {
            implementations,
            inventory: HashMap::new(),
        }
    }

    /// Adds an application-supplied implementation to the registry
    pub fn register_implementation(
        &mut self,
        implementation_id: impl Into<String>,
        constructor: SimilarityConstructor,
    ) -> Result<(), RegistrationError> {
        let implementation_id = implementation_id.into();
        if self.implementations.contains_key(&implementation_id) {
            return Err(RegistrationError::DuplicateRegistration(implementation_id));
        }
        self.implementations.insert(implementation_id, constructor);
        Ok(())
    }

    /// Instantiates one function per `(logical name, implementation id)` pair,
    /// each bound to `profile`.
    ///
    /// Fails on the first logical name that is already in the inventory (including
    /// one that appears twice in `names_to_implementations`), or on the first
    /// unknown implementation id. Pairs before the failing one stay registered.
    pub fn instantiate_funcs<N, I>(
        &mut self,
        names_to_implementations: impl IntoIterator<Item = (N, I)>,
        profile: &Profile,
    ) -> Result<(), RegistrationError>
    where
        N: Into<String>,
        I: AsRef<str>,
    {
        for (name, implementation_id) in names_to_implementations {
            let name = name.into();
            let implementation_id = implementation_id.as_ref();
            if self.inventory.contains_key(&name) {
                return Err(RegistrationError::DuplicateRegistration(name));
            }
            let constructor = self.implementations.get(implementation_id).ok_or_else(|| {
                RegistrationError::UnknownImplementation(implementation_id.to_string())
            })?;
            debug!("Instantiating similarity function {name} as {implementation_id}");
            self.inventory.insert(name, constructor(profile.clone()));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SimilarityFunction>> {
        self.inventory.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inventory.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::SimFuncFactory;
    use crate::{
        error::RegistrationError,
        similarity::{NumericDistance, SimilarityFunction},
    };

    #[test]
    fn instantiates_named_functions_bound_to_the_profile() {
        let mut factory = SimFuncFactory::new();
        factory
            .instantiate_funcs([("proximity", "numeric"), ("topics", "jaccard")], &json!(4))
            .unwrap();

        let proximity = factory.get("proximity").unwrap();
        assert_eq!(proximity.reference(), &json!(4));
        assert_eq!(proximity.compute(&json!(1), &json!(4)), Some(3.0));
        assert!(factory.get("topics").is_some());
        assert!(factory.get("missing").is_none());
    }

    #[test]
    fn second_registration_of_a_name_is_a_duplicate() {
        let mut factory = SimFuncFactory::new();
        factory
            .instantiate_funcs([("proximity", "numeric")], &json!(0))
            .unwrap();
        assert_eq!(
            factory.instantiate_funcs([("proximity", "numeric")], &json!(0)),
            Err(RegistrationError::DuplicateRegistration(
                "proximity".to_string()
            ))
        );
    }

    #[test]
    fn duplicate_names_within_one_call_are_rejected() {
        let mut factory = SimFuncFactory::new();
        assert_eq!(
            factory.instantiate_funcs([("a", "numeric"), ("a", "euclidean")], &json!(0)),
            Err(RegistrationError::DuplicateRegistration("a".to_string()))
        );
    }

    #[test]
    fn unknown_implementations_are_rejected() {
        let mut factory = SimFuncFactory::new();
        assert_eq!(
            factory.instantiate_funcs([("a", "cosine")], &json!(0)),
            Err(RegistrationError::UnknownImplementation(
                "cosine".to_string()
            ))
        );
        assert!(factory.get("a").is_none());
    }

    #[test]
    fn application_implementations_can_be_registered_once() {
        let mut factory = SimFuncFactory::new();
        factory
            .register_implementation("inverted", |p| Arc::new(NumericDistance::new(p)))
            .unwrap();
        assert_eq!(
            factory.register_implementation("numeric", |p| Arc::new(NumericDistance::new(p))),
            Err(RegistrationError::DuplicateRegistration(
                "numeric".to_string()
            ))
        );
        factory
            .instantiate_funcs([("custom", "inverted")], &json!(1))
            .unwrap();
        assert!(factory.get("custom").is_some());
    }
}
