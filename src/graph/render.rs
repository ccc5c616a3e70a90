//! Rendering declarations into ARM requests.
//!
//! References that ARM expects as ids are resolved through [`ResolveId`] at
//! execution time; references by name are rendered as the target's name.

use serde_json::{Map, Value, json};
use std::collections::HashMap;

use crate::cloud::{HASH_TAG, ResourceAddress, ResourceRequest, STACK_TAG};
use crate::config::ConfigHasher;
use crate::error::{DeployError, PlanError, Result};

use super::resource::{DiskAttachment, ResourceDeclaration, ResourceRef, ResourceSpec};

/// Looks up the cloud id of a provisioned declaration.
pub trait ResolveId {
    /// Returns the cloud id of `name`, if it has been provisioned.
    fn resolve_id(&self, name: &str) -> Option<String>;
}

impl ResolveId for HashMap<String, String> {
    fn resolve_id(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Returns the address a declaration is provisioned at.
#[must_use]
pub fn address_of(declaration: &ResourceDeclaration, resource_group: &str) -> ResourceAddress {
    let address = ResourceAddress::new(resource_group, declaration.kind(), declaration.name.clone());
    match declaration.spec.parent() {
        Some(parent) => address.with_parent(parent.name.clone()),
        None => address,
    }
}

/// Computes the spec hash of a declaration.
///
/// # Errors
///
/// Returns an error if the declaration cannot be serialized.
pub fn spec_hash(declaration: &ResourceDeclaration) -> Result<String> {
    let value = serde_json::to_value(declaration).map_err(|e| {
        DeployError::internal(format!(
            "Failed to serialize declaration {}: {e}",
            declaration.name
        ))
    })?;
    Ok(ConfigHasher::new().hash_json(&value))
}

/// Renders a declaration into a create/update request.
///
/// # Errors
///
/// Returns an error if a referenced resource has no known cloud id.
pub fn render(
    declaration: &ResourceDeclaration,
    resource_group: &str,
    stack: &str,
    hash: &str,
    ids: &dyn ResolveId,
) -> Result<ResourceRequest> {
    let id = |target: &ResourceRef| -> Result<Value> {
        ids.resolve_id(&target.name)
            .map(|id| json!({ "id": id }))
            .ok_or_else(|| {
                DeployError::Plan(PlanError::UnresolvedReference {
                    from: declaration.name.clone(),
                    to: target.name.clone(),
                })
            })
    };

    let mut body = match &declaration.spec {
        ResourceSpec::VirtualNetwork { address_space } => json!({
            "properties": { "addressSpace": { "addressPrefixes": address_space } }
        }),
        ResourceSpec::Subnet { address_prefix, .. } => json!({
            "properties": { "addressPrefix": address_prefix }
        }),
        ResourceSpec::PublicIpAddress { allocation, sku } => json!({
            "sku": { "name": sku.as_arm() },
            "properties": { "publicIPAllocationMethod": allocation.as_arm() }
        }),
        ResourceSpec::NetworkSecurityGroup { rules } => {
            let mut sorted: Vec<_> = rules.iter().collect();
            sorted.sort_by_key(|r| r.priority);
            let rules: Vec<Value> = sorted
                .into_iter()
                .map(|rule| {
                    json!({
                        "name": rule.name,
                        "properties": {
                            "protocol": rule.protocol.as_arm(),
                            "direction": rule.direction.as_arm(),
                            "access": rule.access.as_arm(),
                            "priority": rule.priority,
                            "sourcePortRange": rule.source_port_range,
                            "destinationPortRange": rule.port,
                            "sourceAddressPrefix": rule.source_address_prefix,
                            "destinationAddressPrefix": rule.destination_address_prefix,
                        }
                    })
                })
                .collect();
            json!({ "properties": { "securityRules": rules } })
        }
        ResourceSpec::NetworkInterface {
            ip_configuration,
            private_ip_allocation,
            subnet,
            public_ip,
            security_group,
        } => json!({
            "properties": {
                "ipConfigurations": [{
                    "name": ip_configuration,
                    "properties": {
                        "subnet": id(subnet)?,
                        "privateIPAllocationMethod": private_ip_allocation.as_arm(),
                        "publicIPAddress": id(public_ip)?,
                    }
                }],
                "networkSecurityGroup": id(security_group)?,
            }
        }),
        ResourceSpec::Disk {
            size_gb,
            sku,
            source,
        } => json!({
            "sku": { "name": sku.as_arm() },
            "properties": {
                "diskSizeGB": size_gb,
                "creationData": {
                    "createOption": "Copy",
                    "sourceResourceId": source.snapshot_id,
                }
            }
        }),
        ResourceSpec::VirtualMachine {
            size,
            os_type,
            ultra_ssd_enabled,
            network_interface,
            os_disk,
            data_disks,
            ..
        } => {
            let attach = |disk: &DiskAttachment| -> Result<Value> {
                let mut value = json!({
                    "caching": disk.caching.as_arm(),
                    "createOption": "Attach",
                    "managedDisk": id(&disk.disk)?,
                });
                if let Some(lun) = disk.lun {
                    value["lun"] = json!(lun);
                }
                Ok(value)
            };

            let mut os = attach(os_disk)?;
            os["osType"] = json!(os_type.as_arm());
            let data = data_disks.iter().map(attach).collect::<Result<Vec<_>>>()?;

            // Attached OS disks carry their own accounts; ARM rejects osProfile here.
            json!({
                "properties": {
                    "hardwareProfile": { "vmSize": size },
                    "networkProfile": { "networkInterfaces": [id(network_interface)?] },
                    "additionalCapabilities": { "ultraSSDEnabled": ultra_ssd_enabled },
                    "storageProfile": { "osDisk": os, "dataDisks": data },
                }
            })
        }
        ResourceSpec::VirtualMachineExtension {
            publisher,
            extension_type,
            type_handler_version,
            command,
            file_uris,
            ..
        } => json!({
            "properties": {
                "publisher": publisher,
                "type": extension_type,
                "typeHandlerVersion": type_handler_version,
                "settings": {
                    "fileUris": file_uris,
                    "commandToExecute": command,
                }
            }
        }),
        ResourceSpec::AutomationAccount { sku } => json!({
            "properties": { "sku": { "name": sku } }
        }),
        ResourceSpec::Runbook { content_uri, .. } => json!({
            "properties": {
                "runbookType": "PowerShell",
                "logVerbose": true,
                "logProgress": true,
                "publishContentLink": { "uri": content_uri },
            }
        }),
        ResourceSpec::Schedule { start_time, .. } => json!({
            "properties": {
                "startTime": start_time.to_rfc3339(),
                "frequency": "OneTime",
                "timeZone": "UTC",
            }
        }),
        ResourceSpec::JobSchedule {
            runbook,
            schedule,
            virtual_machine,
            resource_group,
            ..
        } => json!({
            "properties": {
                "runbook": { "name": runbook.name },
                "schedule": { "name": schedule.name },
                "parameters": {
                    "ResourceGroupName": resource_group,
                    "VmName": virtual_machine.name,
                }
            }
        }),
    };

    if declaration.kind().is_tracked()
        && let Some(object) = body.as_object_mut()
    {
        let mut tags: Map<String, Value> = declaration
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        tags.insert(STACK_TAG.to_string(), Value::String(stack.to_string()));
        tags.insert(HASH_TAG.to_string(), Value::String(hash.to_string()));

        object.insert(String::from("location"), Value::String(declaration.location.clone()));
        object.insert(String::from("tags"), Value::Object(tags));
    }

    Ok(ResourceRequest {
        address: address_of(declaration, resource_group),
        body,
    })
}
