//! Test fixtures: a board tree and the display panel/backlight overlay,
//! laid out the way a devicetree compiler emits them with symbols enabled.

use crate::fragment::{DORMANT_NODE, OVERLAY_NODE};
use crate::overrides::{encode_entries, OVERRIDES_NODE};
use crate::symbols::{FIXUPS_NODE, LOCAL_FIXUPS_NODE, SYMBOLS_NODE};
use crate::tree::{NodeId, Tree};
use crate::value::PropertyValue;

/// Placeholder a compiler writes for a phandle it cannot resolve.
pub const UNRESOLVED: u32 = 0xffff_ffff;

// Local phandles as compiled into the overlay, before renumbering.
const PANEL: u32 = 1;
const PANEL_IN: u32 = 2;
const DPI_OUT: u32 = 3;
const BL_GPIO: u32 = 4;
const BL_PWM: u32 = 5;
const PWM_PINS: u32 = 6;

fn cells(values: &[u32]) -> PropertyValue {
    PropertyValue::Cells(values.to_vec())
}

fn string(value: &str) -> PropertyValue {
    PropertyValue::String(value.to_string())
}

fn strings(values: &[&str]) -> PropertyValue {
    PropertyValue::Strings(values.iter().map(|s| s.to_string()).collect())
}

/// Board tree with GPIO, PWM, DPI and audio controllers. `audio` has a label
/// but no phandle.
pub fn base_tree() -> Tree {
    let mut t = Tree::new();
    let root = NodeId::ROOT;
    t.set_value(root, "compatible", strings(&["raspberrypi,4-model-b", "brcm,bcm2711"]));
    let soc = t.add_child(root, "soc").unwrap();

    let gpio = t.add_child(soc, "gpio@7e200000").unwrap();
    t.set_value(gpio, "compatible", string("brcm,bcm2711-gpio"));
    t.set_value(gpio, "gpio-controller", PropertyValue::Empty);
    t.set_value(gpio, "#gpio-cells", cells(&[2]));
    t.set_value(gpio, "phandle", cells(&[1]));

    let pwm = t.add_child(soc, "pwm@7e20c000").unwrap();
    t.set_value(pwm, "compatible", string("brcm,bcm2835-pwm"));
    t.set_value(pwm, "#pwm-cells", cells(&[3]));
    t.set_value(pwm, "status", string("disabled"));
    t.set_value(pwm, "phandle", cells(&[2]));

    let dpi = t.add_child(soc, "dpi@7e208000").unwrap();
    t.set_value(dpi, "compatible", string("brcm,bcm2835-dpi"));
    t.set_value(dpi, "status", string("disabled"));
    t.set_value(dpi, "phandle", cells(&[3]));

    let audio = t.add_child(soc, "audio").unwrap();
    t.set_value(audio, "compatible", string("brcm,bcm2835-audio"));
    t.set_value(audio, "status", string("okay"));

    let symbols = t.add_child(root, SYMBOLS_NODE).unwrap();
    t.set_value(symbols, "gpio", string("/soc/gpio@7e200000"));
    t.set_value(symbols, "pwm", string("/soc/pwm@7e20c000"));
    t.set_value(symbols, "dpi", string("/soc/dpi@7e208000"));
    t.set_value(symbols, "audio", string("/soc/audio"));
    t
}

fn fragment(t: &mut Tree, id: u32, patch: &str) -> (NodeId, NodeId) {
    let frag = t.add_child(NodeId::ROOT, &format!("fragment@{}", id)).unwrap();
    let body = t.add_child(frag, patch).unwrap();
    (frag, body)
}

/// Byte offsets of the non-zero phandles in a rule declaration.
fn phandle_slots(entries: &[(u32, &str)]) -> Vec<u32> {
    let mut slots = Vec::new();
    let mut pos = 0u32;
    for (phandle, decl) in entries {
        if *phandle != 0 {
            slots.push(pos);
        }
        pos += 4 + decl.len() as u32 + 1;
    }
    slots
}

// Each backlight path turns its own fragments on and the other path's off.
const GPIO_PATH: &str = "=102=103!104!105!106!107!108";
const PWM_PATH: &str = "=104=105=106=107=108!102!103";

/// Override declarations of the panel overlay.
pub fn panel_rules() -> Vec<(&'static str, Vec<(u32, &'static str)>)> {
    vec![
        ("backlight-gpio", vec![(0, GPIO_PATH), (BL_GPIO, "gpios:4")]),
        ("backlight-pwm", vec![(0, PWM_PATH)]),
        ("backlight-pwm-chan", vec![(0, PWM_PATH), (BL_PWM, "pwms:4")]),
        (
            "backlight-pwm-gpio",
            vec![(0, PWM_PATH), (PWM_PINS, "brcm,pins:0")],
        ),
        (
            "backlight-def-brightness",
            vec![(BL_PWM, "default-brightness-level:0")],
        ),
        ("rotate", vec![(PANEL, "rotation:0")]),
        ("noaudio", vec![(0, "=109")]),
    ]
}

/// Display panel overlay: an always-on panel and DPI link (100, 101), a GPIO
/// backlight path (102, 103), a PWM backlight path (104-108) and an audio
/// side effect (109), all backlight and audio fragments dormant.
pub fn panel_overlay() -> Tree {
    let mut t = Tree::new();
    let root = NodeId::ROOT;
    t.set_value(root, "compatible", string("brcm,bcm2711"));

    // 100: the panel itself
    let (f, o) = fragment(&mut t, 100, OVERLAY_NODE);
    t.set_value(f, "target-path", string("/"));
    let panel = t.add_child(o, "panel").unwrap();
    t.set_value(panel, "compatible", string("panel-dpi"));
    t.set_value(panel, "rotation", cells(&[0]));
    t.set_value(panel, "phandle", cells(&[PANEL]));
    let timing = t.add_child(panel, "panel-timing").unwrap();
    t.set_value(timing, "clock-frequency", cells(&[25_000_000]));
    t.set_value(timing, "hactive", cells(&[800]));
    t.set_value(timing, "vactive", cells(&[480]));
    let port = t.add_child(panel, "port").unwrap();
    let ep = t.add_child(port, "endpoint").unwrap();
    t.set_value(ep, "remote-endpoint", cells(&[DPI_OUT]));
    t.set_value(ep, "phandle", cells(&[PANEL_IN]));

    // 101: DPI output linked back to the panel
    let (f, o) = fragment(&mut t, 101, OVERLAY_NODE);
    t.set_value(f, "target", cells(&[UNRESOLVED]));
    t.set_value(o, "status", string("okay"));
    let port = t.add_child(o, "port").unwrap();
    let ep = t.add_child(port, "endpoint").unwrap();
    t.set_value(ep, "remote-endpoint", cells(&[PANEL_IN]));
    t.set_value(ep, "phandle", cells(&[DPI_OUT]));

    // 102, 103: GPIO backlight
    let (f, o) = fragment(&mut t, 102, DORMANT_NODE);
    t.set_value(f, "target", cells(&[PANEL]));
    t.set_value(o, "backlight", cells(&[BL_GPIO]));
    let (f, o) = fragment(&mut t, 103, DORMANT_NODE);
    t.set_value(f, "target-path", string("/"));
    let bl = t.add_child(o, "backlight_gpio").unwrap();
    t.set_value(bl, "compatible", string("gpio-backlight"));
    t.set_value(bl, "gpios", cells(&[UNRESOLVED, 18, 0]));
    t.set_value(bl, "default-on", PropertyValue::Empty);
    t.set_value(bl, "phandle", cells(&[BL_GPIO]));

    // 104-108: PWM backlight
    let (f, o) = fragment(&mut t, 104, DORMANT_NODE);
    t.set_value(f, "target", cells(&[PANEL]));
    t.set_value(o, "backlight", cells(&[BL_PWM]));
    let (f, o) = fragment(&mut t, 105, DORMANT_NODE);
    t.set_value(f, "target-path", string("/"));
    let bl = t.add_child(o, "backlight_pwm").unwrap();
    t.set_value(bl, "compatible", string("pwm-backlight"));
    t.set_value(bl, "pwms", cells(&[UNRESOLVED, 0, 5_000_000, 0]));
    t.set_value(
        bl,
        "brightness-levels",
        cells(&[0, 6, 8, 12, 16, 24, 32, 40, 48, 64, 96, 128, 160, 192, 224, 255]),
    );
    t.set_value(bl, "default-brightness-level", cells(&[16]));
    t.set_value(bl, "phandle", cells(&[BL_PWM]));
    let (f, o) = fragment(&mut t, 106, DORMANT_NODE);
    t.set_value(f, "target", cells(&[UNRESOLVED]));
    t.set_value(o, "status", string("okay"));
    t.set_value(o, "assigned-clock-rates", cells(&[1_000_000]));
    let (f, o) = fragment(&mut t, 107, DORMANT_NODE);
    t.set_value(f, "target", cells(&[UNRESOLVED]));
    let pins = t.add_child(o, "backlight_pwm_pins").unwrap();
    t.set_value(pins, "brcm,pins", cells(&[18]));
    t.set_value(pins, "brcm,function", cells(&[2]));
    t.set_value(pins, "phandle", cells(&[PWM_PINS]));
    let (f, o) = fragment(&mut t, 108, DORMANT_NODE);
    t.set_value(f, "target", cells(&[UNRESOLVED]));
    t.set_value(o, "pinctrl-names", string("default"));
    t.set_value(o, "pinctrl-0", cells(&[PWM_PINS]));

    // 109: audio shares the PWM pins
    let (f, o) = fragment(&mut t, 109, DORMANT_NODE);
    t.set_value(f, "target", cells(&[UNRESOLVED]));
    t.set_value(o, "status", string("disabled"));

    let overrides = t.add_child(root, OVERRIDES_NODE).unwrap();
    let local = t.add_child(root, LOCAL_FIXUPS_NODE).unwrap();
    let local_overrides = t.add_child(local, OVERRIDES_NODE).unwrap();
    for (name, entries) in panel_rules() {
        t.set_property(overrides, name, encode_entries(&entries));
        let slots = phandle_slots(&entries);
        if !slots.is_empty() {
            t.set_value(local_overrides, name, cells(&slots));
        }
    }

    let symbols = t.add_child(root, SYMBOLS_NODE).unwrap();
    for (label, path) in [
        ("panel", "/fragment@100/__overlay__/panel"),
        ("panel_in", "/fragment@100/__overlay__/panel/port/endpoint"),
        ("dpi_out", "/fragment@101/__overlay__/port/endpoint"),
        ("bl_gpio", "/fragment@103/__dormant__/backlight_gpio"),
        ("bl_pwm", "/fragment@105/__dormant__/backlight_pwm"),
        ("pwm_pins", "/fragment@107/__dormant__/backlight_pwm_pins"),
    ] {
        t.set_value(symbols, label, string(path));
    }

    let fixups = t.add_child(root, FIXUPS_NODE).unwrap();
    t.set_value(fixups, "dpi", strings(&["/fragment@101:target:0"]));
    t.set_value(
        fixups,
        "gpio",
        strings(&[
            "/fragment@103/__dormant__/backlight_gpio:gpios:0",
            "/fragment@107:target:0",
        ]),
    );
    t.set_value(
        fixups,
        "pwm",
        strings(&[
            "/fragment@105/__dormant__/backlight_pwm:pwms:0",
            "/fragment@106:target:0",
            "/fragment@108:target:0",
        ]),
    );
    t.set_value(fixups, "audio", strings(&["/fragment@109:target:0"]));

    // internal references, mirrored under __local_fixups__
    let mirror = |t: &mut Tree, path: &[&str], prop: &str| {
        let mut node = local;
        for part in path {
            node = t.child_or_insert(node, part);
        }
        t.set_value(node, prop, cells(&[0]));
    };
    mirror(&mut t, &["fragment@100", OVERLAY_NODE, "panel", "port", "endpoint"], "remote-endpoint");
    mirror(&mut t, &["fragment@101", OVERLAY_NODE, "port", "endpoint"], "remote-endpoint");
    mirror(&mut t, &["fragment@102"], "target");
    mirror(&mut t, &["fragment@102", DORMANT_NODE], "backlight");
    mirror(&mut t, &["fragment@104"], "target");
    mirror(&mut t, &["fragment@104", DORMANT_NODE], "backlight");
    mirror(&mut t, &["fragment@108", DORMANT_NODE], "pinctrl-0");
    t
}
