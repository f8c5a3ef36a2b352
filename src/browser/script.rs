//! JavaScript run inside the page by the WebDriver renderer

/// Forces a synchronous reflow of the whole document
pub const TRIGGER_REFLOW: &str = "return document.body ? document.body.offsetHeight : 0;";

/// Full scrollable size of the document as `[width, height]`
pub const DOCUMENT_SIZE: &str = r#"
var d = document.documentElement, b = document.body || d;
return [
    Math.max(d.scrollWidth, b.scrollWidth, d.clientWidth),
    Math.max(d.scrollHeight, b.scrollHeight, d.clientHeight)
];
"#;

/// Walks the DOM and returns one entry per captured element
///
/// Arguments: `absolute` (page instead of viewport coordinates),
/// `includeInvisible`, `pixelRatio`. Entries use the `ElementItem` layout.
pub const DETECT_ELEMENTS: &str = r#"
var absolute = arguments[0], includeInvisible = arguments[1], ratio = arguments[2];
var items = [], nextId = 1;

function isVisible(el, rect) {
    var style = window.getComputedStyle(el);
    return style.display !== 'none' && style.visibility !== 'hidden'
        && rect.width > 0 && rect.height > 0;
}

function selectorFor(el, parentSelector) {
    var sel = el.tagName.toLowerCase();
    if (el.id) { sel += '#' + el.id; }
    if (typeof el.className === 'string' && el.className.trim()) {
        sel += '.' + el.className.trim().split(/\s+/).join('.');
    }
    if (el.parentElement) {
        var index = 1, sib = el.previousElementSibling;
        while (sib) {
            if (sib.tagName === el.tagName) { index++; }
            sib = sib.previousElementSibling;
        }
        if (index > 1) { sel += ':nth-of-type(' + index + ')'; }
    }
    return (parentSelector ? parentSelector + ' ' : '') + sel;
}

function walk(el, parentId, parentSelector) {
    var rect = el.getBoundingClientRect();
    var visible = isVisible(el, rect);
    var selector = selectorFor(el, parentSelector);
    var id = parentId;
    if (visible || includeInvisible) {
        var left = rect.left + (absolute ? window.scrollX : 0);
        var top = rect.top + (absolute ? window.scrollY : 0);
        id = nextId++;
        var tag = el.tagName.toLowerCase();
        items.push({
            id: id,
            parent_id: parentId,
            bbox: [
                Math.floor(left * ratio),
                Math.floor(top * ratio),
                Math.floor((left + rect.width) * ratio),
                Math.floor((top + rect.height) * ratio)
            ],
            tag_name: tag,
            label: tag,
            position: window.getComputedStyle(el).position,
            is_visible: visible,
            css_selector: selector
        });
    }
    for (var i = 0; i < el.children.length; i++) {
        walk(el.children[i], id, selector);
    }
}

walk(document.documentElement, null, '');
return items;
"#;
