//! Cache key composition for cached regions.

use sstemplate::fingerprint::fingerprint;

/// Everything one cached region contributes to its lookup key in one render.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKeyMaterial {
    /// Global context string, evaluated fresh for each render.
    pub global_key: String,
    /// Compile-time fingerprint of the originating block.
    pub block_hash: String,
    /// Which piece of the originating block this region is.
    pub segment: usize,
    /// Render-time values of the key expressions, in declared order.
    pub key_values: Vec<String>,
}

/// Compose the lookup key. Pure: equal material always yields an equal key.
pub fn compose_key(material: &CacheKeyMaterial) -> String {
    let mut key = fingerprint(&material.global_key);
    key.push_str(&material.block_hash);
    key.push('_');
    key.push_str(&material.segment.to_string());
    if !material.key_values.is_empty() {
        key.push('_');
        key.push_str(&fingerprint(&encode_values(&material.key_values)));
    }
    key
}

/// Length-prefix each value so no value content can shift a boundary.
fn encode_values(values: &[String]) -> String {
    let mut encoded = String::new();
    for value in values {
        encoded.push_str(&value.len().to_string());
        encoded.push(':');
        encoded.push_str(value);
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(global: &str, values: &[&str]) -> CacheKeyMaterial {
        CacheKeyMaterial {
            global_key: global.to_string(),
            block_hash: fingerprint("<% cached $A %>X<% end_cached %>"),
            segment: 0,
            key_values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn idempotent() {
        let m = material("Stage, 1", &["1", "2"]);
        assert_eq!(compose_key(&m), compose_key(&m.clone()));
    }

    #[test]
    fn every_input_changes_the_key() {
        let base = compose_key(&material("Stage, 1", &["1"]));
        assert_ne!(base, compose_key(&material("Live, 1", &["1"])));
        assert_ne!(base, compose_key(&material("Stage, 1", &["2"])));

        let mut other_block = material("Stage, 1", &["1"]);
        other_block.block_hash = fingerprint("<% cached $A %>Y<% end_cached %>");
        assert_ne!(base, compose_key(&other_block));

        let mut other_segment = material("Stage, 1", &["1"]);
        other_segment.segment = 1;
        assert_ne!(base, compose_key(&other_segment));
    }

    #[test]
    fn empty_key_list_omits_third_component() {
        let m = material("Stage, 1", &[]);
        let key = compose_key(&m);
        let expected = format!("{}{}_0", fingerprint("Stage, 1"), m.block_hash);
        assert_eq!(key, expected);
    }

    #[test]
    fn value_boundaries_are_part_of_the_key() {
        assert_ne!(
            compose_key(&material("", &["a_b", "c"])),
            compose_key(&material("", &["a", "b_c"]))
        );
        assert_ne!(
            compose_key(&material("", &["a\u{1f}b"])),
            compose_key(&material("", &["a", "b"]))
        );
        assert_ne!(
            compose_key(&material("", &["1:a"])),
            compose_key(&material("", &["a"]))
        );
    }

    #[test]
    fn empty_value_differs_from_no_values() {
        assert_ne!(compose_key(&material("", &[""])), compose_key(&material("", &[])));
    }
}
