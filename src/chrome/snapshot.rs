//! Accessibility snapshot protocol.
//!
//! An in-page routine tags every interactable element with a sequential
//! `data-nx-ref` attribute and returns bounded descriptors. Refs stay valid
//! until the DOM changes; click/type address elements by ref only.

use serde::{Deserialize, Serialize};

/// Hard ceiling on elements per snapshot.
pub const MAX_SNAPSHOT_ELEMENTS: usize = 500;

/// One interactable element tagged by the snapshot routine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDescriptor {
    #[serde(rename = "ref")]
    pub ref_id: u32,
    pub tag: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub input_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "ariaLabel")]
    pub aria_label: String,
    #[serde(default)]
    pub placeholder: String,
    #[serde(default)]
    pub href: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Result of one snapshot pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub ts: i64,
    pub elements: Vec<ElementDescriptor>,
}

/// Build the snapshot expression for `Runtime.evaluate`.
pub fn snapshot_expression(include_invisible: bool, max_elements: usize) -> String {
    let max = max_elements.clamp(1, MAX_SNAPSHOT_ELEMENTS);
    format!(
        r#"(function(includeInvisible, maxElements) {{
  document.querySelectorAll('[data-nx-ref]').forEach(function(el) {{
    el.removeAttribute('data-nx-ref');
  }});
  var selectors = [
    'a[href]', 'button', 'input', 'select', 'textarea',
    '[role="button"]', '[role="link"]', '[role="menuitem"]',
    '[onclick]', '[contenteditable]', '[tabindex]', '[aria-label]'
  ];
  var nodes = Array.from(document.querySelectorAll(selectors.join(',')));
  function visible(el) {{
    var style = window.getComputedStyle(el);
    if (style.display === 'none' || style.visibility === 'hidden') return false;
    var rect = el.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
  }}
  function normText(el) {{
    return (el.innerText || el.value || '').replace(/\s+/g, ' ').trim();
  }}
  var seen = new Set();
  var out = [];
  var next = 1;
  for (var i = 0; i < nodes.length; i++) {{
    var el = nodes[i];
    if (el.hasAttribute('tabindex') && parseInt(el.getAttribute('tabindex'), 10) < 0 &&
        !el.matches(selectors.slice(0, 10).join(','))) continue;
    if (!includeInvisible && !visible(el)) continue;
    var rect = el.getBoundingClientRect();
    var text = normText(el);
    var key = [el.tagName, el.id || '', el.getAttribute('name') || '',
               Math.round(rect.x), Math.round(rect.y), text.slice(0, 40)].join('|');
    if (seen.has(key)) continue;
    seen.add(key);
    el.setAttribute('data-nx-ref', String(next));
    out.push({{
      ref: next,
      tag: el.tagName.toLowerCase(),
      id: el.id || '',
      role: el.getAttribute('role') || '',
      name: el.getAttribute('name') || '',
      type: el.getAttribute('type') || '',
      text: text.slice(0, 160),
      ariaLabel: el.getAttribute('aria-label') || '',
      placeholder: el.getAttribute('placeholder') || '',
      href: el.getAttribute('href') || '',
      x: rect.x, y: rect.y, width: rect.width, height: rect.height
    }});
    next++;
    if (out.length >= maxElements) break;
  }}
  return JSON.stringify({{
    url: window.location.href,
    title: document.title,
    ts: Date.now(),
    elements: out
  }});
}})({include_invisible}, {max})"#
    )
}

/// Build the click expression. Resolves to `"ok"`, `"notfound"`, or
/// `"invisible"`.
pub fn click_expression(ref_id: u32) -> String {
    format!(
        r#"(function(ref) {{
  var el = document.querySelector('[data-nx-ref="' + ref + '"]');
  if (!el) return 'notfound';
  var style = window.getComputedStyle(el);
  var rect = el.getBoundingClientRect();
  if (style.display === 'none' || style.visibility === 'hidden' ||
      rect.width === 0 || rect.height === 0) return 'invisible';
  el.scrollIntoView({{ block: 'center', behavior: 'instant' }});
  el.click();
  return 'ok';
}})({ref_id})"#
    )
}

/// Build the fill expression. Resolves to `"ok"` when the element accepted
/// a programmatic value, `"notfound"` when the ref is gone, and
/// `"unfillable"` when the caller should fall back to keyboard input.
pub fn fill_expression(ref_id: u32, text: &str, clear: bool) -> String {
    let text_json = serde_json::Value::String(text.to_string()).to_string();
    format!(
        r#"(function(ref, text, clear) {{
  var el = document.querySelector('[data-nx-ref="' + ref + '"]');
  if (!el) return 'notfound';
  el.focus();
  var tag = el.tagName.toLowerCase();
  if (tag === 'input' || tag === 'textarea') {{
    var value = clear ? text : el.value + text;
    var setter = Object.getOwnPropertyDescriptor(
      tag === 'input' ? window.HTMLInputElement.prototype : window.HTMLTextAreaElement.prototype,
      'value'
    ).set;
    setter.call(el, value);
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return 'ok';
  }}
  if (el.isContentEditable) {{
    if (clear) el.textContent = '';
    el.textContent += text;
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    return 'ok';
  }}
  return 'unfillable';
}})({ref_id}, {text_json}, {clear})"#
    )
}

/// Focus-only expression used before the keyboard fallback.
pub fn focus_expression(ref_id: u32) -> String {
    format!(
        r#"(function(ref) {{
  var el = document.querySelector('[data-nx-ref="' + ref + '"]');
  if (!el) return 'notfound';
  el.focus();
  return 'ok';
}})({ref_id})"#
    )
}
