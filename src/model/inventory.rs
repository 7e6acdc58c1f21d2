//! Built-in schema for the network inventory (DCIM, IPAM and extras types).

use crate::error::SchemaError;
use crate::model::{EntityTypeDef, Normalizer, SchemaRegistry};

pub fn network_inventory() -> Result<SchemaRegistry, SchemaError> {
    SchemaRegistry::from_defs(inventory_types())
}

pub fn inventory_types() -> Vec<EntityTypeDef> {
    vec![
        EntityTypeDef::new("status", &["slug"])
            .attributes(&["name"])
            .unique_fields(&["name"])
            .table("extras_status"),
        EntityTypeDef::new("tag", &["slug"])
            .attributes(&["name", "description", "color"])
            .unique_fields(&["name"])
            .table("extras_tag"),
        EntityTypeDef::new("region", &["slug"])
            .attributes(&["name", "parent", "description"])
            .child("region", "children")
            .child("site", "sites")
            .foreign_key("parent", "region")
            .table("dcim_region"),
        EntityTypeDef::new("site", &["slug"])
            .attributes(&[
                "name",
                "status",
                "region",
                "tenant",
                "facility",
                "asn",
                "description",
                "time_zone",
                "physical_address",
                "shipping_address",
                "latitude",
                "longitude",
                "contact_name",
                "contact_phone",
                "contact_email",
                "comments",
            ])
            .child("vlan", "vlans")
            .child("device", "devices")
            .foreign_key("status", "status")
            .foreign_key("region", "region")
            .table("dcim_site"),
        EntityTypeDef::new("location_type", &["slug"])
            .attributes(&["name", "description", "nestable"])
            .child("location", "locations")
            .table("dcim_locationtype"),
        EntityTypeDef::new("location", &["slug"])
            .attributes(&["name", "location_type", "parent", "description", "site", "tenant"])
            .child("location", "locations")
            .foreign_key("location_type", "location_type")
            .foreign_key("parent", "location")
            .foreign_key("site", "site")
            .table("dcim_location"),
        EntityTypeDef::new("manufacturer", &["slug"])
            .attributes(&["name"])
            .child("device_type", "device_types")
            .table("dcim_manufacturer"),
        EntityTypeDef::new("platform", &["slug"])
            .attributes(&["name", "manufacturer"])
            .foreign_key("manufacturer", "manufacturer")
            .table("dcim_platform"),
        EntityTypeDef::new("device_type", &["slug"])
            .attributes(&["model", "manufacturer"])
            .child("device", "devices")
            .foreign_key("manufacturer", "manufacturer")
            .table("dcim_devicetype"),
        EntityTypeDef::new("device_role", &["slug"])
            .attributes(&["name"])
            .child("device", "devices")
            .table("dcim_devicerole"),
        EntityTypeDef::new("device_redundancy_group", &["name"])
            .attributes(&["slug", "description", "failover_strategy", "comments"])
            .table("dcim_deviceredundancygroup"),
        EntityTypeDef::new("device", &["name"])
            .attributes(&[
                "site",
                "device_type",
                "device_role",
                "platform",
                "status",
                "device_redundancy_group",
                "device_redundancy_group_priority",
            ])
            .child("interface", "interfaces")
            .foreign_key("site", "site")
            .foreign_key("device_type", "device_type")
            .foreign_key("device_role", "device_role")
            .foreign_key("platform", "platform")
            .foreign_key("status", "status")
            .foreign_key("device_redundancy_group", "device_redundancy_group")
            .table("dcim_device"),
        EntityTypeDef::new("vlan", &["site", "vid"])
            .attributes(&["name", "status"])
            .short_label("vid")
            .foreign_key("site", "site")
            .foreign_key("status", "status")
            .table("ipam_vlan"),
        EntityTypeDef::new("interface", &["device", "name"])
            .attributes(&["description", "mode", "tagged_vlans", "untagged_vlan", "type", "status"])
            .short_label("name")
            .foreign_key("device", "device")
            .foreign_key("untagged_vlan", "vlan")
            .foreign_key("status", "status")
            .many_to_many("tagged_vlans", "vlan")
            .normalize("mode", Normalizer::Lowercase)
            .normalize(
                "type",
                Normalizer::Slug {
                    strip_prefix: Some("A_".to_string()),
                },
            )
            .table("dcim_interface"),
        // `assigned_interface` carries the interface unique id; `device` and
        // `interface` only exist to build the lookup key.
        EntityTypeDef::new("ip_address", &["address"])
            .attributes(&["device", "interface", "assigned_interface", "status", "dns_name", "description"])
            .skip(&["device", "interface"])
            .generic_relation("assigned_interface", "interface", &["device", "interface"], "assigned_object")
            .foreign_key("status", "status")
            .table("ipam_ipaddress"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldKind;

    #[test]
    fn test_inventory_schema_is_valid() {
        let registry = network_inventory().unwrap();
        assert_eq!(registry.len(), 15);
        assert!(registry.types().all(|t| t.has_table()));
    }

    #[test]
    fn test_inventory_dependency_order() {
        let order = network_inventory().unwrap().dependency_order().unwrap();
        let position = |name: &str| order.iter().position(|t| t == name).unwrap();

        assert!(position("status") < position("site"));
        assert!(position("region") < position("site"));
        assert!(position("site") < position("device"));
        assert!(position("device") < position("interface"));
        assert!(position("vlan") < position("interface"));
        assert!(position("interface") < position("ip_address"));
        assert!(position("manufacturer") < position("device_type"));
    }

    #[test]
    fn test_interface_relations() {
        let registry = network_inventory().unwrap();
        let interface = registry.require("interface").unwrap();
        assert_eq!(
            interface.kind("tagged_vlans"),
            &FieldKind::ManyToMany { target: "vlan".to_string() }
        );
        assert_eq!(interface.field_referencing("device"), Some("device"));
        assert!(registry.is_child_type("interface"));
    }
}
