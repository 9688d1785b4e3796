//! Global tables of known message and service type descriptors.
//!
//! Typed endpoints carry their descriptors in trait consts; the tables exist
//! for the type-erased endpoints (`advertise_any` / `subscribe_any`), which
//! need to resolve a type name at runtime. Registration is append-only:
//! re-registering an identical descriptor is a no-op, a conflicting one is
//! rejected.

use embros_common::{Error, RosMessageType, RosServiceType};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::RwLock;

/// An immutable message (or service) type descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageTypeInfo {
    /// Canonical type name, e.g. `std_msgs/String`.
    pub name: String,
    /// Hex MD5 over the canonical definition.
    pub md5sum: String,
    /// Full type definition; may be empty for types only ever re-published.
    pub definition: String,
}

lazy_static! {
    static ref MESSAGE_TYPES: RwLock<HashMap<String, MessageTypeInfo>> =
        RwLock::new(HashMap::new());
    static ref SERVICE_TYPES: RwLock<HashMap<String, MessageTypeInfo>> =
        RwLock::new(HashMap::new());
}

fn register(
    table: &RwLock<HashMap<String, MessageTypeInfo>>,
    info: MessageTypeInfo,
) -> Result<(), Error> {
    let mut table = table.write().expect("type table poisoned");
    match table.get(&info.name) {
        Some(existing) if *existing == info => Ok(()),
        Some(_) => Err(Error::BadParam(format!(
            "type {:?} is already registered with a different descriptor",
            info.name
        ))),
        None => {
            table.insert(info.name.clone(), info);
            Ok(())
        }
    }
}

fn lookup(table: &RwLock<HashMap<String, MessageTypeInfo>>, name: &str) -> Option<MessageTypeInfo> {
    table.read().expect("type table poisoned").get(name).cloned()
}

/// Registers a message type from its trait consts.
pub fn register_message_type<T: RosMessageType>() -> Result<(), Error> {
    register_message_type_raw(T::ROS_TYPE_NAME, T::MD5SUM, T::DEFINITION)
}

/// Registers a message type from runtime strings.
pub fn register_message_type_raw(
    name: &str,
    md5sum: &str,
    definition: &str,
) -> Result<(), Error> {
    register(
        &MESSAGE_TYPES,
        MessageTypeInfo {
            name: name.to_owned(),
            md5sum: md5sum.to_owned(),
            definition: definition.to_owned(),
        },
    )
}

pub fn lookup_message_type(name: &str) -> Option<MessageTypeInfo> {
    lookup(&MESSAGE_TYPES, name)
}

/// Registers a service type from its trait consts.
pub fn register_service_type<T: RosServiceType>() -> Result<(), Error> {
    register(
        &SERVICE_TYPES,
        MessageTypeInfo {
            name: T::ROS_SERVICE_NAME.to_owned(),
            md5sum: T::MD5SUM.to_owned(),
            definition: String::new(),
        },
    )
}

pub fn lookup_service_type(name: &str) -> Option<MessageTypeInfo> {
    lookup(&SERVICE_TYPES, name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_registration_must_match() {
        register_message_type_raw("registry_test/A", "aaa", "int32 x").unwrap();
        // identical: fine
        register_message_type_raw("registry_test/A", "aaa", "int32 x").unwrap();
        // conflicting md5: rejected
        assert!(matches!(
            register_message_type_raw("registry_test/A", "bbb", "int32 x"),
            Err(Error::BadParam(_))
        ));
    }

    #[test]
    fn lookup_is_by_exact_name() {
        register_message_type_raw("registry_test/B", "ccc", "").unwrap();
        assert_eq!(lookup_message_type("registry_test/B").unwrap().md5sum, "ccc");
        assert!(lookup_message_type("registry_test/b").is_none());
    }
}
