use super::*;

#[test]
fn test_parse_bare_uuid_means_all_devices() {
    let uuid = Uuid::new_v4();
    let addr: Address = uuid.to_string().parse().unwrap();

    assert_eq!(addr.user_id, uuid);
    assert_eq!(addr.device_id, None);
}

#[test]
fn test_parse_uuid_with_device() {
    let uuid = Uuid::new_v4();
    let s = format!("{}.7", uuid);
    let addr: Address = s.parse().unwrap();

    assert_eq!(addr.user_id, uuid);
    assert_eq!(addr.device_id, Some(7));
}

#[test]
fn test_parse_more_than_one_dot_is_an_error() {
    let uuid = Uuid::new_v4();
    let s = format!("{}.7.8", uuid);
    assert!(s.parse::<Address>().is_err());
}

#[test]
fn test_parse_invalid_uuid_is_an_error() {
    assert!("not-a-uuid".parse::<Address>().is_err());
}

#[test]
fn test_parse_invalid_device_id_is_an_error() {
    let uuid = Uuid::new_v4();
    let s = format!("{}.not-a-number", uuid);
    assert!(s.parse::<Address>().is_err());
}

#[test]
fn test_display_roundtrips_through_parse() {
    let uuid = Uuid::new_v4();
    let addr = Address::new(uuid, Some(3));
    let s = addr.to_string();
    let reparsed: Address = s.parse().unwrap();

    assert_eq!(addr, reparsed);
}

#[test]
fn test_display_bare_address_has_no_trailing_dot() {
    let uuid = Uuid::new_v4();
    let addr = Address::all_devices(uuid);

    assert_eq!(addr.to_string(), uuid.to_string());
}

#[test]
fn test_with_device_preserves_user_id() {
    let uuid = Uuid::new_v4();
    let addr = Address::all_devices(uuid).with_device(5);

    assert_eq!(addr.user_id, uuid);
    assert_eq!(addr.device_id, Some(5));
}
